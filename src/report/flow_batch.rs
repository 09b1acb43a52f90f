use chrono::NaiveDate;
use polars::{
    error::PolarsError,
    frame::DataFrame,
    prelude::{Column, DataType, IntoLazy, PlSmallStr, col},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    data::{domain::date_to_epoch_days, window::WindowSpec},
    error::EngineResult,
    report::{
        io::{Report, ReportName},
        polars_ext::polars_to_engine_error,
    },
    window::FlowRecord,
};

/// Prefix of the per-window flow columns, e.g. `flow_12m`.
pub const FLOW_COLUMN_PREFIX: &str = "flow_";

/// Fixed leading columns of a flow batch; one `flow_<window>` column per window follows.
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
pub enum FlowCol {
    Allocator,
    AssetClass,
    ReferenceDate,
    TotalPosition,
}

impl From<FlowCol> for PlSmallStr {
    fn from(value: FlowCol) -> Self {
        value.as_str().into()
    }
}

impl FlowCol {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Name of the flow column for `window`.
pub fn flow_column(window: &WindowSpec) -> String {
    format!("{FLOW_COLUMN_PREFIX}{}", window.column_suffix())
}

/// All flow rows computed for one reference date.
#[derive(Debug, Clone)]
pub struct FlowBatch {
    reference_date: NaiveDate,
    df: DataFrame,
}

impl Report for FlowBatch {
    fn as_df(&self) -> &DataFrame {
        &self.df
    }
}

impl ReportName for FlowBatch {
    fn base_name(&self) -> String {
        format!("fund_flow_{}", self.reference_date)
    }
}

impl FlowBatch {
    pub fn new(
        reference_date: NaiveDate,
        records: &[FlowRecord],
        windows: &[WindowSpec],
    ) -> EngineResult<Self> {
        let to_err = |e: PolarsError| polars_to_engine_error("FlowBatch", e);

        let mut columns = vec![
            Column::new(
                FlowCol::Allocator.into(),
                records.iter().map(|r| r.allocator().to_string()).collect::<Vec<_>>(),
            ),
            Column::new(
                FlowCol::AssetClass.into(),
                records.iter().map(|r| r.asset_class().to_string()).collect::<Vec<_>>(),
            ),
            Column::new(
                FlowCol::ReferenceDate.into(),
                records
                    .iter()
                    .map(|r| date_to_epoch_days(r.reference_date))
                    .collect::<Vec<_>>(),
            ),
            Column::new(
                FlowCol::TotalPosition.into(),
                records.iter().map(|r| r.total_position).collect::<Vec<_>>(),
            ),
        ];

        for window in windows {
            let values: Vec<Option<f64>> =
                records.iter().map(|r| r.flow(window.label())).collect();
            columns.push(Column::new(flow_column(window).into(), values));
        }

        let df = DataFrame::new(columns)
            .map_err(to_err)?
            .lazy()
            .with_column(col(FlowCol::ReferenceDate).cast(DataType::Date))
            .collect()
            .map_err(to_err)?;

        Ok(Self { reference_date, df })
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date
    }

    pub fn height(&self) -> usize {
        self.df.height()
    }
}
