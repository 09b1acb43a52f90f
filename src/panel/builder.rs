use chrono::NaiveDate;
use ndarray::Array2;
use tracing::{debug, warn};

use crate::{
    data::{domain::EntityId, grid::DateGrid, observation::EntitySeries},
    error::{DataError, EngineResult},
    panel::Panel,
};

/// Pivots per-entity observation series onto a [`DateGrid`].
///
/// Each grid cell takes the most recent defined observation at or before the grid date
/// (an as-of join, which is the forward fill of the pivoted table). Cells before an entity's
/// first defined observation stay `NaN`.
#[derive(Debug, Clone)]
pub struct PanelBuilder {
    grid: DateGrid,
}

impl PanelBuilder {
    pub fn new(grid: DateGrid) -> Self {
        Self { grid }
    }

    #[tracing::instrument(skip_all, fields(dates = self.grid.len(), entities = series.len()))]
    pub fn build(self, series: &EntitySeries) -> EngineResult<Panel> {
        let n_dates = self.grid.len();

        let mut entities: Vec<EntityId> = Vec::with_capacity(series.len());
        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(series.len());
        let mut inception: Vec<usize> = Vec::with_capacity(series.len());

        for (entity, observations) in series {
            ensure_unique_dates(entity, observations)?;

            let column = self.as_of_column(observations);
            match column.iter().position(|v| !v.is_nan()) {
                Some(first) => {
                    entities.push(entity.clone());
                    columns.push(column);
                    inception.push(first);
                }
                None => {
                    debug!(entity = %entity, "Entity has no defined value on the grid; omitted");
                }
            }
        }

        let n_entities = entities.len();
        let mut values = Array2::<f64>::from_elem((n_dates, n_entities), f64::NAN);
        for (j, column) in columns.into_iter().enumerate() {
            for (i, v) in column.into_iter().enumerate() {
                values[[i, j]] = v;
            }
        }

        if n_entities == 0 {
            warn!("Panel built without any entity");
        }

        Ok(Panel::from_parts(self.grid, entities, values, inception))
    }

    fn as_of_column(&self, observations: &[(NaiveDate, Option<f64>)]) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.grid.len());
        let mut cursor = 0;
        let mut last = f64::NAN;

        for date in self.grid.iter() {
            while let Some((obs_date, value)) = observations.get(cursor) {
                if *obs_date > date {
                    break;
                }
                if let Some(v) = value {
                    last = *v;
                }
                cursor += 1;
            }
            out.push(last);
        }
        out
    }
}

/// The pivot requires `(entity, date)` to be unique and ordered.
fn ensure_unique_dates(
    entity: &EntityId,
    observations: &[(NaiveDate, Option<f64>)],
) -> EngineResult<()> {
    for pair in observations.windows(2) {
        let (prev, next) = (pair[0].0, pair[1].0);
        if next == prev {
            return Err(DataError::DuplicateObservation {
                entity: entity.key(),
                date: next.to_string(),
            }
            .into());
        }
        if next < prev {
            return Err(DataError::ShapeMismatch(format!(
                "observations for '{entity}' are not sorted by date"
            ))
            .into());
        }
    }
    Ok(())
}
