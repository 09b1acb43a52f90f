use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
};

use chrono::NaiveDate;

use crate::{
    data::{
        domain::{EntityId, IndexCode},
        observation::RawObservation,
        window::{Mode, WindowSpec},
    },
    error::{EngineResult, StoreError},
    store::{ClassificationLookup, ObservationSource, ResultSink, on_or_after},
    window::{FlowRecord, MetricRecord},
};

#[derive(Debug, Clone)]
struct PositionRow {
    allocator: String,
    asset_class: String,
    date: String,
    market_value: Option<f64>,
}

/// In-process store implementing every port; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    valuations: Vec<RawObservation>,
    positions: Vec<PositionRow>,
    index_levels: HashMap<IndexCode, Vec<(String, Option<f64>)>>,
    classifications: Vec<(String, String)>,
    metrics: RefCell<Vec<MetricRecord>>,
    flows: RefCell<Vec<FlowRecord>>,
    failing_dates: RefCell<HashSet<NaiveDate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_valuation(
        mut self,
        code: &str,
        sub_class: Option<&str>,
        date: &str,
        value: Option<f64>,
    ) -> Self {
        self.push_valuation(code, sub_class, date, value);
        self
    }

    pub fn push_valuation(
        &mut self,
        code: &str,
        sub_class: Option<&str>,
        date: &str,
        value: Option<f64>,
    ) {
        let seq = self.valuations.len() as i64;
        self.valuations.push(RawObservation {
            code: code.to_string(),
            qualifier: sub_class.map(str::to_string),
            date: date.to_string(),
            value,
            seq,
        });
    }

    pub fn with_position(
        mut self,
        allocator: &str,
        asset_class: &str,
        date: &str,
        market_value: Option<f64>,
    ) -> Self {
        self.positions.push(PositionRow {
            allocator: allocator.to_string(),
            asset_class: asset_class.to_string(),
            date: date.to_string(),
            market_value,
        });
        self
    }

    pub fn with_index_level(mut self, code: &str, date: &str, value: Option<f64>) -> Self {
        self.push_index_level(code, date, value);
        self
    }

    pub fn push_index_level(&mut self, code: &str, date: &str, value: Option<f64>) {
        self.index_levels
            .entry(IndexCode::from(code))
            .or_default()
            .push((date.to_string(), value));
    }

    pub fn with_classification(mut self, code: &str, label: &str) -> Self {
        self.classifications
            .push((code.to_string(), label.to_string()));
        self
    }

    /// Makes every append for `date` fail, as a crash before commit would.
    pub fn fail_writes_on(&self, date: NaiveDate) {
        self.failing_dates.borrow_mut().insert(date);
    }

    pub fn clear_failures(&self) {
        self.failing_dates.borrow_mut().clear();
    }

    pub fn metric_rows(&self) -> Vec<MetricRecord> {
        self.metrics.borrow().clone()
    }

    pub fn flow_rows(&self) -> Vec<FlowRecord> {
        self.flows.borrow().clone()
    }

    fn check_failure(&self, reference_date: NaiveDate) -> EngineResult<()> {
        if self.failing_dates.borrow().contains(&reference_date) {
            return Err(StoreError::AppendRejected {
                date: reference_date.to_string(),
                msg: "simulated write failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl ObservationSource for MemoryStore {
    fn valuations(&self, since: NaiveDate) -> EngineResult<Vec<RawObservation>> {
        Ok(self
            .valuations
            .iter()
            .filter(|row| on_or_after(&row.date, since))
            .cloned()
            .collect())
    }

    fn positions(&self) -> EngineResult<Vec<RawObservation>> {
        let mut grouped: BTreeMap<(String, String, String), (Option<f64>, i64)> = BTreeMap::new();
        for (seq, row) in self.positions.iter().enumerate() {
            let key = (
                row.allocator.clone(),
                row.asset_class.clone(),
                row.date.clone(),
            );
            let entry = grouped.entry(key).or_insert((None, seq as i64));
            if let Some(v) = row.market_value {
                entry.0 = Some(entry.0.unwrap_or(0.0) + v);
            }
        }

        Ok(grouped
            .into_iter()
            .map(|((allocator, asset_class, date), (value, seq))| RawObservation {
                code: allocator,
                qualifier: Some(asset_class),
                date,
                value,
                seq,
            })
            .collect())
    }

    fn index_levels(
        &self,
        code: &IndexCode,
        since: NaiveDate,
    ) -> EngineResult<Vec<RawObservation>> {
        let Some(levels) = self.index_levels.get(code) else {
            return Ok(Vec::new());
        };
        Ok(levels
            .iter()
            .enumerate()
            .filter(|(_, (date, _))| on_or_after(date, since))
            .map(|(seq, (date, value))| RawObservation {
                code: code.to_string(),
                qualifier: None,
                date: date.clone(),
                value: *value,
                seq: seq as i64,
            })
            .collect())
    }
}

impl ClassificationLookup for MemoryStore {
    fn asset_class_labels(&self) -> EngineResult<HashMap<String, String>> {
        let mut labels = HashMap::new();
        for (code, label) in &self.classifications {
            labels.entry(code.clone()).or_insert_with(|| label.clone());
        }
        Ok(labels)
    }
}

impl ResultSink for MemoryStore {
    fn checkpoint(&self, mode: Mode, reference_date: NaiveDate) -> EngineResult<HashSet<String>> {
        let keys = match mode {
            Mode::Metrics => self
                .metrics
                .borrow()
                .iter()
                .filter(|r| r.reference_date == reference_date)
                .map(|r| r.entity.key())
                .collect(),
            Mode::Flow => self
                .flows
                .borrow()
                .iter()
                .filter(|r| r.reference_date == reference_date)
                .map(|r| r.entity.key())
                .collect(),
        };
        Ok(keys)
    }

    fn append_metrics(
        &self,
        reference_date: NaiveDate,
        records: &[MetricRecord],
    ) -> EngineResult<usize> {
        self.check_failure(reference_date)?;

        let mut seen: HashSet<(String, NaiveDate, String)> = self
            .metrics
            .borrow()
            .iter()
            .map(|r| (r.entity.key(), r.reference_date, r.window.clone()))
            .collect();
        for r in records {
            if !seen.insert((r.entity.key(), r.reference_date, r.window.clone())) {
                return Err(StoreError::AppendRejected {
                    date: reference_date.to_string(),
                    msg: format!("duplicate metric row for '{}' window '{}'", r.entity, r.window),
                }
                .into());
            }
        }

        self.metrics.borrow_mut().extend_from_slice(records);
        Ok(records.len())
    }

    fn append_flows(
        &self,
        reference_date: NaiveDate,
        records: &[FlowRecord],
        windows: &[WindowSpec],
    ) -> EngineResult<usize> {
        self.check_failure(reference_date)?;

        let mut seen: HashSet<(EntityId, NaiveDate)> = self
            .flows
            .borrow()
            .iter()
            .map(|r| (r.entity.clone(), r.reference_date))
            .collect();
        for r in records {
            if let Some((label, _)) = r
                .flows
                .iter()
                .find(|(label, _)| windows.iter().all(|w| w.label() != label))
            {
                return Err(StoreError::AppendRejected {
                    date: reference_date.to_string(),
                    msg: format!("flow row for '{}' has unknown window '{label}'", r.entity),
                }
                .into());
            }
            if !seen.insert((r.entity.clone(), r.reference_date)) {
                return Err(StoreError::AppendRejected {
                    date: reference_date.to_string(),
                    msg: format!("duplicate flow row for '{}'", r.entity),
                }
                .into());
            }
        }

        self.flows.borrow_mut().extend_from_slice(records);
        Ok(records.len())
    }
}
