pub mod benchmark;
pub mod builder;
pub mod returns;

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::data::{domain::EntityId, grid::DateGrid};

/// Dense `date × entity` matrix of forward-filled values.
///
/// Absent values are `NaN`. An entity's column is `NaN` strictly before its inception row and
/// defined from it onwards.
#[derive(Debug, Clone)]
pub struct Panel {
    grid: DateGrid,
    entities: Vec<EntityId>,
    column_index: HashMap<EntityId, usize>,
    values: Array2<f64>,
    inception: Vec<usize>,
}

impl Panel {
    pub(crate) fn from_parts(
        grid: DateGrid,
        entities: Vec<EntityId>,
        values: Array2<f64>,
        inception: Vec<usize>,
    ) -> Self {
        let column_index = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.clone(), i))
            .collect();
        Self {
            grid,
            entities,
            column_index,
            values,
            inception,
        }
    }

    pub fn grid(&self) -> &DateGrid {
        &self.grid
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn column(&self, idx: usize) -> ArrayView1<'_, f64> {
        self.values.column(idx)
    }

    pub fn row(&self, idx: usize) -> ArrayView1<'_, f64> {
        self.values.index_axis(Axis(0), idx)
    }

    pub fn n_dates(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_entities(&self) -> usize {
        self.values.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_of(&self, entity: &EntityId) -> Option<usize> {
        self.column_index.get(entity).copied()
    }

    /// Grid row of the first defined value per column.
    pub fn inception_rows(&self) -> &[usize] {
        &self.inception
    }

    pub fn inception_date(&self, entity: &EntityId) -> Option<NaiveDate> {
        let col = self.column_of(entity)?;
        self.grid.get(self.inception[col])
    }

    /// `entity -> first valid date` for every column.
    pub fn inception_map(&self) -> BTreeMap<EntityId, NaiveDate> {
        self.entities
            .iter()
            .zip(&self.inception)
            .filter_map(|(e, &row)| self.grid.get(row).map(|d| (e.clone(), d)))
            .collect()
    }

    /// The panel value at `date` (which must be on the grid), `None` when absent.
    pub fn value(&self, date: NaiveDate, entity: &EntityId) -> Option<f64> {
        let row = self.grid.index_of(date)?;
        let col = self.column_of(entity)?;
        let v = self.values[[row, col]];
        (!v.is_nan()).then_some(v)
    }
}
