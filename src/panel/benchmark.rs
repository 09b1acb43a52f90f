use std::collections::HashMap;

use chrono::NaiveDate;

use crate::{
    data::{domain::IndexCode, observation::EntitySeries},
    error::{EngineResult, SetupError},
};

/// One benchmark index, forward-filled on its own calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkSeries {
    dates: Vec<NaiveDate>,
    levels: Vec<f64>,
}

impl BenchmarkSeries {
    /// Keeps only defined, positive levels; input must be sorted by date.
    pub fn new(points: impl IntoIterator<Item = (NaiveDate, Option<f64>)>) -> Self {
        let (dates, levels) = points
            .into_iter()
            .filter_map(|(d, v)| v.filter(|v| v.is_finite() && *v > 0.0).map(|v| (d, v)))
            .unzip();
        Self { dates, levels }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Level of the latest point at or before `date`.
    pub fn level_as_of(&self, date: NaiveDate) -> Option<f64> {
        let idx = self.dates.partition_point(|d| *d <= date).checked_sub(1)?;
        self.levels.get(idx).copied()
    }

    /// Cumulative return over exactly `dates`: `exp(Σ ln(l[k]/l[k-1])) - 1` on as-of levels.
    ///
    /// `None` when fewer than two dates are given or any date precedes the series.
    pub fn window_return(&self, dates: &[NaiveDate]) -> Option<f64> {
        if dates.len() < 2 {
            return None;
        }

        let mut log_sum = 0.0;
        let mut prev = self.level_as_of(dates[0])?;
        for date in &dates[1..] {
            let cur = self.level_as_of(*date)?;
            log_sum += (cur / prev).ln();
            prev = cur;
        }
        Some(log_sum.exp_m1())
    }
}

/// Index series keyed by code, aligned on demand to a window's exact date index.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkAligner {
    series: HashMap<IndexCode, BenchmarkSeries>,
}

impl BenchmarkAligner {
    /// Builds the aligner from loaded index observations, where the entity code is the index code.
    pub fn from_entity_series(series: &EntitySeries) -> Self {
        let series = series
            .iter()
            .map(|(entity, points)| {
                (
                    IndexCode::from(entity.code()),
                    BenchmarkSeries::new(points.iter().copied()),
                )
            })
            .collect();
        Self { series }
    }

    pub fn insert(&mut self, code: IndexCode, series: BenchmarkSeries) {
        self.series.insert(code, series);
    }

    pub fn get(&self, code: &IndexCode) -> Option<&BenchmarkSeries> {
        self.series.get(code)
    }

    /// Fails with a setup error unless every code has at least one usable level.
    pub fn require(&self, codes: &[&IndexCode]) -> EngineResult<()> {
        for code in codes {
            if self.series.get(*code).is_none_or(BenchmarkSeries::is_empty) {
                return Err(SetupError::MissingBenchmark(code.to_string()).into());
            }
        }
        Ok(())
    }

    pub fn window_return(&self, code: &IndexCode, dates: &[NaiveDate]) -> Option<f64> {
        self.series.get(code)?.window_return(dates)
    }
}
