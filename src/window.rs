pub mod flow;
pub mod metrics;

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    data::{
        domain::EntityId,
        grid::DateGrid,
        window::{Mode, WindowSpec},
    },
    error::{DataError, EngineResult},
    window::{flow::FlowCalculator, metrics::MetricsCalculator},
};

// ================================================================================================
// Records
// ================================================================================================

/// Risk/return snapshot of one entity for one `(reference_date, window)`.
///
/// Ratio fields are `None` when their denominator is zero or undefined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub entity: EntityId,
    pub reference_date: NaiveDate,
    pub window: String,
    pub ret: f64,
    pub volatility: Option<f64>,
    pub max_drawdown: f64,
    pub recovery_time: f64,
    pub sharpe: Option<f64>,
    pub calmar: Option<f64>,
    pub hit_ratio: f64,
    pub information_ratio: Option<f64>,
}

/// Position change of one allocator/asset-class pair over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowValue {
    pub entity: EntityId,
    pub position: f64,
    pub flow: f64,
}

/// Flow snapshot of one allocator/asset-class pair at a reference date, across all windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub entity: EntityId,
    pub reference_date: NaiveDate,
    pub total_position: f64,
    /// `(window label, flow)` in window-table order. A window that failed to compute is absent.
    pub flows: Vec<(String, f64)>,
}

impl FlowRecord {
    pub fn allocator(&self) -> &str {
        self.entity.code()
    }

    pub fn asset_class(&self) -> &str {
        self.entity.qualifier()
    }

    pub fn flow(&self, window: &str) -> Option<f64> {
        self.flows
            .iter()
            .find(|(label, _)| label == window)
            .map(|(_, flow)| *flow)
    }

    pub fn is_empty(&self) -> bool {
        self.total_position == 0.0 && self.flows.iter().all(|(_, f)| *f == 0.0)
    }
}

// ================================================================================================
// Calculator
// ================================================================================================

/// Outcome of one `(reference_date, window)` computation.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowResult {
    /// Not enough history before the reference date; deliberately produces nothing.
    InsufficientHistory,
    Metrics(Vec<MetricRecord>),
    Flow(Vec<FlowValue>),
}

impl WindowResult {
    pub fn len(&self) -> usize {
        match self {
            Self::InsufficientHistory => 0,
            Self::Metrics(rows) => rows.len(),
            Self::Flow(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The window engine, tagged by mode.
///
/// Both variants share the same slicing contract: `i_end` is the row of the reference date and
/// `i_start = i_end - periods`. They differ in what happens when `i_start` falls before the
/// panel: metrics skip the window, flows use a zero baseline.
#[derive(Debug)]
pub enum WindowCalculator<'a> {
    Metrics(MetricsCalculator<'a>),
    Flow(FlowCalculator<'a>),
}

impl WindowCalculator<'_> {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Metrics(_) => Mode::Metrics,
            Self::Flow(_) => Mode::Flow,
        }
    }

    /// Computes one window for the candidate entities.
    ///
    /// `candidates` restricts output to those entities; `None` means every panel entity.
    pub fn compute(
        &self,
        reference_date: NaiveDate,
        window: &WindowSpec,
        candidates: Option<&HashSet<EntityId>>,
    ) -> EngineResult<WindowResult> {
        match self {
            Self::Metrics(calc) => calc.compute(reference_date, window, candidates),
            Self::Flow(calc) => calc.compute(reference_date, window, candidates),
        }
    }
}

/// Row index of `reference_date` on a grid, as a data error when absent.
pub(crate) fn reference_row(grid: &DateGrid, reference_date: NaiveDate) -> EngineResult<usize> {
    grid.index_of(reference_date)
        .ok_or_else(|| DataError::UnknownReferenceDate(reference_date.to_string()).into())
}
