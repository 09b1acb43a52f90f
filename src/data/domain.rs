use std::{fmt, str::FromStr};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DataError, EngineError},
    impl_from_primitive,
};

// ================================================================================================
// Domain Strong Types (NewTypes)
// ================================================================================================

/// Qualifier used when a fund has no sub-class.
pub const DEFAULT_QUALIFIER: &str = "MASTER";

/// Separator between the code and qualifier halves of an entity key.
pub const KEY_SEPARATOR: &str = " | ";

/// Number of periods per year used to annualize volatility.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct AnnualizationFactor(pub f64);
impl_from_primitive!(AnnualizationFactor, f64);

impl Default for AnnualizationFactor {
    fn default() -> Self {
        Self(252.0)
    }
}

impl AnnualizationFactor {
    pub fn sqrt(self) -> f64 {
        self.0.sqrt()
    }
}

/// Code of a benchmark index series (e.g. `CDI`, `IBOV`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexCode(pub String);

impl fmt::Display for IndexCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IndexCode {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ================================================================================================
// Entity
// ================================================================================================

/// A column of the panel.
///
/// For valuation series this is a quoted share class: the fund code plus its
/// sub-class (or [`DEFAULT_QUALIFIER`] when the fund has a single class). For
/// position series the qualifier is the asset class the allocator invests in.
///
/// Ordering is lexicographic on `(code, qualifier)`, which fixes the column
/// order of every panel built from the same observation set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    code: String,
    qualifier: String,
}

impl EntityId {
    pub fn new(code: impl Into<String>, qualifier: Option<&str>) -> Self {
        let qualifier = qualifier
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .unwrap_or(DEFAULT_QUALIFIER);
        Self {
            code: code.into().trim().to_string(),
            qualifier: qualifier.to_string(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    /// The qualifier as stored in the destination: `None` for the default class.
    pub fn sub_class(&self) -> Option<&str> {
        (self.qualifier != DEFAULT_QUALIFIER).then_some(self.qualifier.as_str())
    }

    /// Composite key used for checkpoints and destination rows.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.code, self.qualifier)
    }
}

impl FromStr for EntityId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(KEY_SEPARATOR) {
            Some((code, qualifier)) if !code.trim().is_empty() => {
                Ok(Self::new(code, Some(qualifier)))
            }
            None if !s.trim().is_empty() => Ok(Self::new(s, None)),
            _ => Err(DataError::InvalidEntityKey(s.to_string()).into()),
        }
    }
}

// ================================================================================================
// Classification
// ================================================================================================

/// Asset classification of a fund, used only to pick the information-ratio benchmark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Equity,
    Other(String),
    Unclassified,
}

impl AssetClass {
    /// Classifies a raw class label by case-insensitive substring match.
    pub fn from_label(label: &str, equity_markers: &[String]) -> Self {
        let lowered = label.to_lowercase();
        if equity_markers
            .iter()
            .any(|m| !m.is_empty() && lowered.contains(&m.to_lowercase()))
        {
            Self::Equity
        } else {
            Self::Other(label.to_string())
        }
    }

    pub fn is_equity(&self) -> bool {
        matches!(self, Self::Equity)
    }
}

// ================================================================================================
// Dates
// ================================================================================================

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub(crate) fn date_to_epoch_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub(crate) fn epoch_days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}

/// Parses the date formats found in the valuation tables.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` (time is discarded),
/// `YYYYMMDD` and `DD/MM/YYYY`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .or_else(|_| NaiveDate::parse_from_str(head, "%d/%m/%Y"))
        .ok()
}

/// Last calendar day of the month containing `date`.
pub fn month_end(date: NaiveDate) -> NaiveDate {
    let (y, m) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|d| d.pred_opt())
        .unwrap_or(date)
}
