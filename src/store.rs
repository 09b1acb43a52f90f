pub mod memory;
pub mod sqlite;

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::{
    data::{
        domain::{AssetClass, EntityId, IndexCode, parse_date},
        observation::RawObservation,
        window::{Mode, WindowSpec},
    },
    error::EngineResult,
    window::{FlowRecord, MetricRecord},
};

/// Read-only access to the raw series the engine consumes.
pub trait ObservationSource {
    /// Share-price observations dated on or after `since`.
    fn valuations(&self, since: NaiveDate) -> EngineResult<Vec<RawObservation>>;

    /// Allocator positions summed per `(allocator, asset_class, date)`.
    ///
    /// The allocator is returned as `code`, the asset class as `qualifier`.
    fn positions(&self) -> EngineResult<Vec<RawObservation>>;

    /// Levels of one benchmark index dated on or after `since`, with the index code as `code`.
    fn index_levels(&self, code: &IndexCode, since: NaiveDate)
    -> EngineResult<Vec<RawObservation>>;
}

/// Read-only `fund_code -> asset class label` mapping.
pub trait ClassificationLookup {
    /// First label per fund code.
    fn asset_class_labels(&self) -> EngineResult<HashMap<String, String>>;
}

/// Append-only destination of computed batches.
///
/// Implementations never update or delete rows. Each append is atomic: either the whole batch is
/// stored or nothing is.
pub trait ResultSink {
    /// Entity keys already persisted at `reference_date` for `mode`.
    fn checkpoint(&self, mode: Mode, reference_date: NaiveDate) -> EngineResult<HashSet<String>>;

    fn append_metrics(
        &self,
        reference_date: NaiveDate,
        records: &[MetricRecord],
    ) -> EngineResult<usize>;

    fn append_flows(
        &self,
        reference_date: NaiveDate,
        records: &[FlowRecord],
        windows: &[WindowSpec],
    ) -> EngineResult<usize>;
}

impl<T: ObservationSource + ?Sized> ObservationSource for &T {
    fn valuations(&self, since: NaiveDate) -> EngineResult<Vec<RawObservation>> {
        (**self).valuations(since)
    }

    fn positions(&self) -> EngineResult<Vec<RawObservation>> {
        (**self).positions()
    }

    fn index_levels(
        &self,
        code: &IndexCode,
        since: NaiveDate,
    ) -> EngineResult<Vec<RawObservation>> {
        (**self).index_levels(code, since)
    }
}

/// Date filter shared by the adapters. Dates are compared parsed, whatever their raw format;
/// unparseable dates are kept so the loader can report them.
pub(crate) fn on_or_after(date: &str, since: NaiveDate) -> bool {
    parse_date(date).is_none_or(|d| d >= since)
}

/// Equity flag per entity, in the given order. Unclassified entities are not equity.
pub fn equity_flags(
    lookup: &impl ClassificationLookup,
    entities: &[EntityId],
    equity_markers: &[String],
) -> EngineResult<Vec<bool>> {
    let labels = lookup.asset_class_labels()?;
    Ok(entities
        .iter()
        .map(|e| {
            labels
                .get(e.code())
                .map(|label| AssetClass::from_label(label, equity_markers))
                .is_some_and(|class| class.is_equity())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn equity_flags_follow_classification() {
        let store = MemoryStore::new()
            .with_classification("F1", "Ações Livre")
            .with_classification("F2", "Renda Fixa")
            .with_classification("F1", "Renda Fixa");
        let markers = vec!["Ações".to_string(), "Equity".to_string()];
        let entities = [
            EntityId::new("F1", None),
            EntityId::new("F2", Some("S1")),
            EntityId::new("F3", None),
        ];

        let flags = equity_flags(&store, &entities, &markers).expect("flags");
        assert_eq!(flags, vec![true, false, false]);
    }
}
