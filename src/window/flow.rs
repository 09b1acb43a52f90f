use std::collections::HashSet;

use chrono::NaiveDate;
use ndarray::Array2;

use crate::{
    data::{domain::EntityId, window::WindowSpec},
    error::{DataError, EngineResult},
    panel::Panel,
    window::{FlowValue, WindowResult, reference_row},
};

/// Flow-mode window engine over a position-level matrix.
///
/// `flow = level(i_end) - level(i_end - periods)`, with a zero baseline whenever the earlier
/// level does not exist (before the panel start or before the entity's inception).
#[derive(Debug)]
pub struct FlowCalculator<'a> {
    panel: &'a Panel,
    levels: &'a Array2<f64>,
}

impl<'a> FlowCalculator<'a> {
    pub fn new(panel: &'a Panel, levels: &'a Array2<f64>) -> EngineResult<Self> {
        if levels.dim() != panel.values().dim() {
            return Err(DataError::ShapeMismatch(format!(
                "levels {:?} vs panel {:?}",
                levels.dim(),
                panel.values().dim()
            ))
            .into());
        }
        Ok(Self { panel, levels })
    }

    pub fn compute(
        &self,
        reference_date: NaiveDate,
        window: &WindowSpec,
        candidates: Option<&HashSet<EntityId>>,
    ) -> EngineResult<WindowResult> {
        let i_end = reference_row(self.panel.grid(), reference_date)?;
        let current = self.levels.row(i_end);
        let baseline = i_end
            .checked_sub(window.periods())
            .map(|i_past| self.levels.row(i_past));

        let flows = self
            .panel
            .entities()
            .iter()
            .enumerate()
            .filter(|(_, entity)| candidates.is_none_or(|c| c.contains(*entity)))
            .filter_map(|(j, entity)| {
                let position = current[j];
                // Not yet invested at the reference date.
                if position.is_nan() {
                    return None;
                }
                let past = baseline
                    .as_ref()
                    .map(|row| row[j])
                    .filter(|v| !v.is_nan())
                    .unwrap_or(0.0);
                Some(FlowValue {
                    entity: entity.clone(),
                    position,
                    flow: position - past,
                })
            })
            .collect();

        Ok(WindowResult::Flow(flows))
    }
}
