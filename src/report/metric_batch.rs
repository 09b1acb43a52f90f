use std::sync::Arc;

use chrono::NaiveDate;
use polars::{
    df,
    error::PolarsError,
    frame::DataFrame,
    prelude::{DataType, Field, IntoLazy, PlSmallStr, Schema, SchemaRef, col},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    data::domain::date_to_epoch_days,
    error::EngineResult,
    report::{
        io::{Report, ReportName, ToSchema},
        polars_ext::polars_to_engine_error,
    },
    window::MetricRecord,
};

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
    PartialOrd,
    Ord,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum MetricCol {
    // === Identifiers ===
    /// `"<fund_code> | <qualifier>"`.
    EntityKey,
    FundCode,
    /// `None` for the default share class.
    SubClass,
    ReferenceDate,
    Window,

    // === Metrics ===
    /// Cumulative return over the window.
    Return,
    /// Annualised standard deviation of log returns.
    Volatility,
    MaxDrawdown,
    /// Mean length, in periods, of below-peak runs.
    RecoveryTime,
    Sharpe,
    Calmar,
    HitRatio,
    InformationRatio,
}

impl From<MetricCol> for PlSmallStr {
    fn from(value: MetricCol) -> Self {
        value.as_str().into()
    }
}

impl MetricCol {
    pub fn name(&self) -> PlSmallStr {
        (*self).into()
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// All metric rows computed for one reference date.
#[derive(Debug, Clone)]
pub struct MetricBatch {
    reference_date: NaiveDate,
    df: DataFrame,
}

impl Report for MetricBatch {
    fn as_df(&self) -> &DataFrame {
        &self.df
    }
}

impl ReportName for MetricBatch {
    fn base_name(&self) -> String {
        format!("fund_metrics_{}", self.reference_date)
    }
}

impl ToSchema for MetricBatch {
    fn to_schema() -> SchemaRef {
        let fields: Vec<Field> = MetricCol::iter()
            .map(|col| {
                let dtype = match col {
                    MetricCol::EntityKey
                    | MetricCol::FundCode
                    | MetricCol::SubClass
                    | MetricCol::Window => DataType::String,

                    MetricCol::ReferenceDate => DataType::Date,

                    MetricCol::Return
                    | MetricCol::Volatility
                    | MetricCol::MaxDrawdown
                    | MetricCol::RecoveryTime
                    | MetricCol::Sharpe
                    | MetricCol::Calmar
                    | MetricCol::HitRatio
                    | MetricCol::InformationRatio => DataType::Float64,
                };
                Field::new(col.into(), dtype)
            })
            .collect();

        Arc::new(Schema::from_iter(fields))
    }
}

impl MetricBatch {
    pub fn new(reference_date: NaiveDate, records: &[MetricRecord]) -> EngineResult<Self> {
        let soa = MetricSoA::from(records);
        let to_err = |e: PolarsError| polars_to_engine_error("MetricBatch", e);

        let df = df![
            // === Identifiers ===
            MetricCol::EntityKey.to_string()        => soa.entity_key,
            MetricCol::FundCode.to_string()         => soa.fund_code,
            MetricCol::SubClass.to_string()         => soa.sub_class,
            MetricCol::ReferenceDate.to_string()    => soa.reference_date,
            MetricCol::Window.to_string()           => soa.window,

            // === Metrics ===
            MetricCol::Return.to_string()           => soa.ret,
            MetricCol::Volatility.to_string()       => soa.volatility,
            MetricCol::MaxDrawdown.to_string()      => soa.max_drawdown,
            MetricCol::RecoveryTime.to_string()     => soa.recovery_time,
            MetricCol::Sharpe.to_string()           => soa.sharpe,
            MetricCol::Calmar.to_string()           => soa.calmar,
            MetricCol::HitRatio.to_string()         => soa.hit_ratio,
            MetricCol::InformationRatio.to_string() => soa.information_ratio,
        ]
        .map_err(to_err)?;

        let df = df
            .lazy()
            .with_column(col(MetricCol::ReferenceDate).cast(DataType::Date))
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

/// Struct-of-arrays view of `&[MetricRecord]`.
#[derive(Default, Debug)]
struct MetricSoA {
    entity_key: Vec<String>,
    fund_code: Vec<String>,
    sub_class: Vec<Option<String>>,
    reference_date: Vec<i32>,
    window: Vec<String>,
    ret: Vec<f64>,
    volatility: Vec<Option<f64>>,
    max_drawdown: Vec<f64>,
    recovery_time: Vec<f64>,
    sharpe: Vec<Option<f64>>,
    calmar: Vec<Option<f64>>,
    hit_ratio: Vec<f64>,
    information_ratio: Vec<Option<f64>>,
}

impl From<&[MetricRecord]> for MetricSoA {
    fn from(records: &[MetricRecord]) -> Self {
        let mut soa = Self::default();
        for r in records {
            soa.entity_key.push(r.entity.key());
            soa.fund_code.push(r.entity.code().to_string());
            soa.sub_class.push(r.entity.sub_class().map(str::to_string));
            soa.reference_date.push(date_to_epoch_days(r.reference_date));
            soa.window.push(r.window.clone());
            soa.ret.push(r.ret);
            soa.volatility.push(r.volatility);
            soa.max_drawdown.push(r.max_drawdown);
            soa.recovery_time.push(r.recovery_time);
            soa.sharpe.push(r.sharpe);
            soa.calmar.push(r.calmar);
            soa.hit_ratio.push(r.hit_ratio);
            soa.information_ratio.push(r.information_ratio);
        }
        soa
    }
}
