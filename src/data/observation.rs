use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use polars::{
    df,
    frame::DataFrame,
    prelude::{BooleanChunked, IntoLazy, PlSmallStr, SortMultipleOptions, col},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use tracing::warn;

use crate::{
    data::domain::{EntityId, date_to_epoch_days, epoch_days_to_date, parse_date},
    error::{DataError, EngineError, EngineResult, SystemError},
};

// ================================================================================================
// Raw Input
// ================================================================================================

/// One row as read from the observation source, before any normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub code: String,
    pub qualifier: Option<String>,
    pub date: String,
    pub value: Option<f64>,
    /// Arrival order in the source; the highest sequence wins on duplicates.
    pub seq: i64,
}

/// How raw values are screened before they reach the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValuePolicy {
    /// Share prices: non-positive or non-finite values become missing.
    PositiveOnly,
    /// Position levels: only non-finite values become missing.
    Finite,
}

impl ValuePolicy {
    fn screen(self, value: Option<f64>) -> Option<f64> {
        match (self, value) {
            (Self::PositiveOnly, Some(v)) if v.is_finite() && v > 0.0 => Some(v),
            (Self::Finite, Some(v)) if v.is_finite() => Some(v),
            _ => None,
        }
    }
}

/// Counters describing what the loader discarded or neutralised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub rows_read: usize,
    pub malformed_dates: usize,
    pub before_start: usize,
    pub invalid_values: usize,
    pub duplicates_resolved: usize,
    pub dropped_entities: Vec<String>,
}

// ================================================================================================
// Observation Frame
// ================================================================================================

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
pub enum ObservationCol {
    EntityId,
    FundCode,
    Qualifier,
    /// Days since the Unix epoch.
    Date,
    Value,
    Seq,
}

impl From<ObservationCol> for PlSmallStr {
    fn from(value: ObservationCol) -> Self {
        value.as_str().into()
    }
}

impl ObservationCol {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Normalised, de-duplicated observations, unique on `(entity, date)` and sorted by both.
#[derive(Debug, Clone)]
pub struct ObservationFrame {
    df: DataFrame,
}

/// Per-entity observation series: `(date, value)` sorted by date, `None` for a neutralised value.
pub type EntitySeries = BTreeMap<EntityId, Vec<(NaiveDate, Option<f64>)>>;

impl ObservationFrame {
    pub fn as_df(&self) -> &DataFrame {
        &self.df
    }

    pub fn height(&self) -> usize {
        self.df.height()
    }

    pub fn is_empty(&self) -> bool {
        self.df.height() == 0
    }

    /// All distinct observation dates.
    pub fn dates(&self) -> EngineResult<BTreeSet<NaiveDate>> {
        let days = self
            .df
            .column(ObservationCol::Date.as_str())
            .and_then(|c| c.i32().cloned())
            .map_err(|e| DataError::DataFrame(e.to_string()))?;

        days.into_iter()
            .flatten()
            .map(|d| {
                epoch_days_to_date(d).ok_or_else(|| {
                    EngineError::from(SystemError::InvariantViolation(format!(
                        "epoch day {d} out of range"
                    )))
                })
            })
            .collect()
    }

    /// Splits the frame back into one series per entity.
    pub fn entity_series(&self) -> EngineResult<EntitySeries> {
        let to_err = |e: polars::error::PolarsError| DataError::DataFrame(e.to_string());
        let codes = self
            .df
            .column(ObservationCol::FundCode.as_str())
            .map_err(to_err)?
            .str()
            .map_err(to_err)?;
        let qualifiers = self
            .df
            .column(ObservationCol::Qualifier.as_str())
            .map_err(to_err)?
            .str()
            .map_err(to_err)?;
        let dates = self
            .df
            .column(ObservationCol::Date.as_str())
            .map_err(to_err)?
            .i32()
            .map_err(to_err)?;
        let values = self
            .df
            .column(ObservationCol::Value.as_str())
            .map_err(to_err)?
            .f64()
            .map_err(to_err)?;

        let mut out = EntitySeries::new();
        for i in 0..self.df.height() {
            let (Some(code), Some(qualifier), Some(days)) =
                (codes.get(i), qualifiers.get(i), dates.get(i))
            else {
                return Err(SystemError::InvariantViolation(format!(
                    "observation row {i} has a null key"
                ))
                .into());
            };
            let date = epoch_days_to_date(days).ok_or_else(|| {
                SystemError::InvariantViolation(format!("epoch day {days} out of range"))
            })?;
            out.entry(EntityId::new(code, Some(qualifier)))
                .or_default()
                .push((date, values.get(i)));
        }
        Ok(out)
    }
}

// ================================================================================================
// Loader
// ================================================================================================

/// Column-oriented buffer of accepted rows (struct of arrays).
#[derive(Default, Debug)]
struct ObservationSoA {
    entity_id: Vec<String>,
    fund_code: Vec<String>,
    qualifier: Vec<String>,
    date: Vec<i32>,
    value: Vec<Option<f64>>,
    seq: Vec<i64>,
}

impl ObservationSoA {
    fn with_capacity(n: usize) -> Self {
        Self {
            entity_id: Vec::with_capacity(n),
            fund_code: Vec::with_capacity(n),
            qualifier: Vec::with_capacity(n),
            date: Vec::with_capacity(n),
            value: Vec::with_capacity(n),
            seq: Vec::with_capacity(n),
        }
    }

    fn push(&mut self, entity: &EntityId, date: NaiveDate, value: Option<f64>, seq: i64) {
        self.entity_id.push(entity.key());
        self.fund_code.push(entity.code().to_string());
        self.qualifier.push(entity.qualifier().to_string());
        self.date.push(date_to_epoch_days(date));
        self.value.push(value);
        self.seq.push(seq);
    }
}

/// Normalises raw rows into an [`ObservationFrame`].
///
/// Rows with malformed dates are dropped with a warning; values failing `policy` are kept as
/// missing so they are later forward-filled over. Duplicate `(entity, date)` rows are resolved
/// latest-wins by `seq`. Entities left without a single valid value are dropped.
#[tracing::instrument(skip_all, fields(rows = rows.len()))]
pub fn load_observations(
    rows: &[RawObservation],
    policy: ValuePolicy,
    since: Option<NaiveDate>,
) -> EngineResult<(ObservationFrame, LoadReport)> {
    let mut report = LoadReport {
        rows_read: rows.len(),
        ..Default::default()
    };
    let mut soa = ObservationSoA::with_capacity(rows.len());

    for row in rows {
        if row.code.trim().is_empty() {
            warn!(value = %row.date, "Dropping observation without entity code");
            continue;
        }
        let entity = EntityId::new(row.code.as_str(), row.qualifier.as_deref());

        let Some(date) = parse_date(&row.date) else {
            report.malformed_dates += 1;
            warn!(entity = %entity, value = %row.date, "Dropping observation with malformed date");
            continue;
        };
        if since.is_some_and(|s| date < s) {
            report.before_start += 1;
            continue;
        }

        let value = policy.screen(row.value);
        if value.is_none() {
            report.invalid_values += 1;
        }
        soa.push(&entity, date, value, row.seq);
    }

    let accepted = soa.date.len();
    let df = df![
        ObservationCol::EntityId.to_string()    => soa.entity_id,
        ObservationCol::FundCode.to_string()    => soa.fund_code,
        ObservationCol::Qualifier.to_string()   => soa.qualifier,
        ObservationCol::Date.to_string()        => soa.date,
        ObservationCol::Value.to_string()       => soa.value,
        ObservationCol::Seq.to_string()         => soa.seq,
    ]
    .map_err(|e| DataError::DataFrame(e.to_string()))?;

    let deduped = df
        .lazy()
        .sort([ObservationCol::Seq.as_str()], SortMultipleOptions::default())
        .group_by_stable([col(ObservationCol::EntityId), col(ObservationCol::Date)])
        .agg([
            col(ObservationCol::FundCode).last(),
            col(ObservationCol::Qualifier).last(),
            col(ObservationCol::Value).last(),
            col(ObservationCol::Seq).last(),
        ])
        .sort(
            [ObservationCol::EntityId.as_str(), ObservationCol::Date.as_str()],
            SortMultipleOptions::default(),
        )
        .select([
            col(ObservationCol::EntityId),
            col(ObservationCol::FundCode),
            col(ObservationCol::Qualifier),
            col(ObservationCol::Date),
            col(ObservationCol::Value),
            col(ObservationCol::Seq),
        ])
        .collect()
        .map_err(|e| DataError::DataFrame(format!("Observation de-duplication failed: {e}")))?;

    report.duplicates_resolved = accepted - deduped.height();

    let (frame, dropped) = drop_empty_entities(deduped)?;
    for entity in &dropped {
        warn!(entity = %entity, "Dropping entity without a single valid observation");
    }
    report.dropped_entities = dropped;

    if report.malformed_dates > 0 || report.invalid_values > 0 {
        warn!(
            malformed_dates = report.malformed_dates,
            invalid_values = report.invalid_values,
            "Observation rows neutralised during load"
        );
    }

    Ok((ObservationFrame { df: frame }, report))
}

fn drop_empty_entities(df: DataFrame) -> EngineResult<(DataFrame, Vec<String>)> {
    let to_err = |e: polars::error::PolarsError| DataError::DataFrame(e.to_string());
    let keys = df
        .column(ObservationCol::EntityId.as_str())
        .map_err(to_err)?
        .str()
        .map_err(to_err)?;
    let values = df
        .column(ObservationCol::Value.as_str())
        .map_err(to_err)?
        .f64()
        .map_err(to_err)?;

    let mut all: BTreeSet<&str> = BTreeSet::new();
    let mut with_value: BTreeSet<&str> = BTreeSet::new();
    for (key, value) in keys.into_iter().zip(values) {
        if let Some(key) = key {
            all.insert(key);
            if value.is_some() {
                with_value.insert(key);
            }
        }
    }

    let dropped: Vec<String> = all
        .difference(&with_value)
        .map(|k| (*k).to_string())
        .collect();
    if dropped.is_empty() {
        return Ok((df, dropped));
    }

    let mask = keys
        .into_iter()
        .map(|k| k.is_some_and(|k| with_value.contains(k)))
        .collect::<BooleanChunked>();
    let filtered = df.filter(&mask).map_err(to_err)?;
    Ok((filtered, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(code: &str, qualifier: Option<&str>, date: &str, value: f64, seq: i64) -> RawObservation {
        RawObservation {
            code: code.to_string(),
            qualifier: qualifier.map(str::to_string),
            date: date.to_string(),
            value: Some(value),
            seq,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    #[test]
    fn latest_reported_row_wins() {
        let rows = vec![
            raw("F1", None, "2024-01-31", 100.0, 1),
            raw("F1", None, "2024-01-31", 101.0, 3),
            raw("F1", None, "2024-01-31", 99.0, 2),
            raw("F1", None, "2024-02-29", 102.0, 4),
        ];

        let (frame, report) =
            load_observations(&rows, ValuePolicy::PositiveOnly, None).expect("load succeeds");
        assert_eq!(frame.height(), 2);
        assert_eq!(report.duplicates_resolved, 2);

        let series = frame.entity_series().expect("series");
        let f1 = &series[&EntityId::new("F1", None)];
        assert_eq!(f1[0], (d(2024, 1, 31), Some(101.0)), "highest seq must win");
        assert_eq!(f1[1], (d(2024, 2, 29), Some(102.0)));
    }

    #[test]
    fn malformed_dates_are_dropped_not_fatal() {
        let rows = vec![
            raw("F1", Some("A"), "2024-01-31", 100.0, 1),
            raw("F1", Some("A"), "31-31-2024", 100.0, 2),
            raw("F2", None, "garbage", 50.0, 3),
        ];

        let (frame, report) =
            load_observations(&rows, ValuePolicy::PositiveOnly, None).expect("load succeeds");
        assert_eq!(report.malformed_dates, 2);
        assert_eq!(frame.height(), 1);
        let series = frame.entity_series().expect("series");
        assert_eq!(series.len(), 1, "F2 had no parseable rows and must not appear");
    }

    #[test]
    fn non_positive_prices_become_missing_and_empty_entities_drop() {
        let rows = vec![
            raw("F1", None, "2024-01-31", 100.0, 1),
            raw("F1", None, "2024-02-29", 0.0, 2),
            raw("F2", None, "2024-01-31", -5.0, 3),
        ];

        let (frame, report) =
            load_observations(&rows, ValuePolicy::PositiveOnly, None).expect("load succeeds");
        assert_eq!(report.invalid_values, 2);
        assert_eq!(report.dropped_entities, vec!["F2 | MASTER".to_string()]);

        let series = frame.entity_series().expect("series");
        let f1 = &series[&EntityId::new("F1", None)];
        assert_eq!(f1[1], (d(2024, 2, 29), None), "zero price is kept as missing");
        assert!(!series.contains_key(&EntityId::new("F2", None)));
    }

    #[test]
    fn finite_policy_keeps_negative_positions() {
        let rows = vec![raw("ALLOC", Some("Renda Fixa"), "2024-01-31", -250.0, 1)];
        let (frame, _) = load_observations(&rows, ValuePolicy::Finite, None).expect("load");
        let series = frame.entity_series().expect("series");
        assert_eq!(
            series[&EntityId::new("ALLOC", Some("Renda Fixa"))][0].1,
            Some(-250.0)
        );
    }

    #[test]
    fn since_filter_discards_older_rows() {
        let rows = vec![
            raw("F1", None, "2014-05-30", 90.0, 1),
            raw("F1", None, "2014-06-02", 91.0, 2),
        ];
        let (frame, report) =
            load_observations(&rows, ValuePolicy::PositiveOnly, Some(d(2014, 6, 1)))
                .expect("load");
        assert_eq!(report.before_start, 1);
        let dates = frame.dates().expect("dates");
        assert_eq!(dates.into_iter().collect::<Vec<_>>(), vec![d(2014, 6, 2)]);
    }
}
