#![allow(dead_code)]

use chrono::NaiveDate;
use fundmetrics::prelude::*;

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
}

/// Month ends of 2024, `MONTH_ENDS[0]` is January.
pub const MONTH_ENDS: [(u32, u32); 12] = [
    (1, 31),
    (2, 29),
    (3, 31),
    (4, 30),
    (5, 31),
    (6, 30),
    (7, 31),
    (8, 31),
    (9, 30),
    (10, 31),
    (11, 30),
    (12, 31),
];

/// 2024 month end of `month` (1-based).
pub fn me(month: u32) -> NaiveDate {
    let (m, day) = MONTH_ENDS[(month - 1) as usize];
    d(2024, m, day)
}

pub fn window(label: &str, periods: usize) -> WindowSpec {
    WindowSpec::new(label, periods).expect("valid window")
}

/// Builder for monthly 2024 fixtures on the in-memory store.
#[derive(Default)]
pub struct FixtureBuilder {
    store: MemoryStore,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share-price series starting at `first_month`, one value per month end.
    pub fn fund(mut self, code: &str, sub_class: Option<&str>, first_month: u32, values: &[f64]) -> Self {
        for (k, v) in values.iter().enumerate() {
            let date = me(first_month + k as u32);
            self.store
                .push_valuation(code, sub_class, &date.to_string(), Some(*v));
        }
        self
    }

    /// Flat-growth CDI and IBOV levels on every 2024 month end.
    pub fn benchmarks(mut self) -> Self {
        for month in 1..=12 {
            let date = me(month).to_string();
            let k = (month - 1) as i32;
            self.store
                .push_index_level("CDI", &date, Some(100.0 * 1.01_f64.powi(k)));
            self.store
                .push_index_level("IBOV", &date, Some(100.0 * 1.02_f64.powi(k)));
        }
        self
    }

    pub fn classification(self, code: &str, label: &str) -> Self {
        Self {
            store: self.store.with_classification(code, label),
        }
    }

    /// Position series starting at `first_month`.
    pub fn positions(mut self, allocator: &str, asset_class: &str, first_month: u32, values: &[f64]) -> Self {
        for (k, v) in values.iter().enumerate() {
            let date = me(first_month + k as u32).to_string();
            self.store = self
                .store
                .with_position(allocator, asset_class, &date, Some(*v));
        }
        self
    }

    pub fn build(self) -> MemoryStore {
        self.store
    }
}

/// Metrics-only configuration over 2024 with short windows.
pub fn metrics_config(windows: Vec<WindowSpec>) -> EngineConfig {
    EngineConfig::default()
        .with_modes(vec![Mode::Metrics])
        .with_observation_start(d(2023, 12, 1))
        .with_reference_start(d(2024, 1, 1))
        .with_metric_windows(windows)
}

/// Flow-only configuration over 2024 with short windows.
pub fn flow_config(windows: Vec<WindowSpec>) -> EngineConfig {
    EngineConfig::default()
        .with_modes(vec![Mode::Flow])
        .with_observation_start(d(2023, 12, 1))
        .with_reference_start(d(2024, 1, 1))
        .with_flow_windows(windows)
}

pub fn find_metric<'a>(
    rows: &'a [MetricRecord],
    key: &str,
    date: NaiveDate,
    window: &str,
) -> Option<&'a MetricRecord> {
    rows.iter()
        .find(|r| r.entity.key() == key && r.reference_date == date && r.window == window)
}

pub fn find_flow<'a>(rows: &'a [FlowRecord], key: &str, date: NaiveDate) -> Option<&'a FlowRecord> {
    rows.iter()
        .find(|r| r.entity.key() == key && r.reference_date == date)
}

pub fn flow_of(record: &FlowRecord, window: &str) -> f64 {
    record
        .flows
        .iter()
        .find(|(label, _)| label == window)
        .map(|(_, f)| *f)
        .expect("window present")
}

pub fn assert_close(actual: f64, expected: f64, what: &str) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "{what}: expected {expected}, got {actual}"
    );
}
