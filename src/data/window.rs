use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{DataError, EngineResult};

/// Trading periods per month on a business-day calendar.
pub const TRADING_PERIODS_PER_MONTH: usize = 21;

/// Month labels shared by both default window tables.
const DEFAULT_MONTHS: [usize; 6] = [6, 12, 24, 36, 48, 60];

/// The two computation modes of the window engine.
///
/// `Metrics` works on log returns and skips any window without full history;
/// `Flow` works on raw position levels and treats missing history as a zero baseline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Metrics,
    Flow,
}

/// A look-back window: a label such as `"12M"` and the number of grid periods it spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSpec {
    label: String,
    periods: usize,
}

impl WindowSpec {
    pub fn new(label: impl Into<String>, periods: usize) -> EngineResult<Self> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(DataError::InvalidWindow("empty window label".to_string()).into());
        }
        if periods == 0 {
            return Err(DataError::InvalidWindow(format!("window '{label}' has zero periods")).into());
        }
        Ok(Self { label, periods })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn periods(&self) -> usize {
        self.periods
    }

    /// Column-safe form of the label, e.g. `"12M"` -> `"12m"`.
    pub fn column_suffix(&self) -> String {
        self.label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }
}

/// Default windows for the metrics mode, counted in trading periods.
pub fn default_metric_windows() -> Vec<WindowSpec> {
    DEFAULT_MONTHS
        .iter()
        .map(|&m| WindowSpec {
            label: format!("{m}M"),
            periods: m * TRADING_PERIODS_PER_MONTH,
        })
        .collect()
}

/// Default windows for the flow mode, counted in month-end periods.
pub fn default_flow_windows() -> Vec<WindowSpec> {
    DEFAULT_MONTHS
        .iter()
        .map(|&m| WindowSpec {
            label: format!("{m}M"),
            periods: m,
        })
        .collect()
}

/// Checks a window table for emptiness, zero periods and duplicate labels.
pub fn validate_windows(windows: &[WindowSpec]) -> EngineResult<()> {
    if windows.is_empty() {
        return Err(DataError::InvalidWindow("window table is empty".to_string()).into());
    }
    let mut seen = HashSet::with_capacity(windows.len());
    let mut suffixes = HashSet::with_capacity(windows.len());
    for w in windows {
        if w.periods == 0 {
            return Err(
                DataError::InvalidWindow(format!("window '{}' has zero periods", w.label)).into(),
            );
        }
        if !seen.insert(w.label.as_str()) {
            return Err(
                DataError::InvalidWindow(format!("duplicate window label '{}'", w.label)).into(),
            );
        }
        if !suffixes.insert(w.column_suffix()) {
            return Err(DataError::InvalidWindow(format!(
                "window '{}' collides with another label after normalisation",
                w.label
            ))
            .into());
        }
    }
    Ok(())
}
