use chrono::{Datelike, NaiveDate};
use itertools::Itertools;

use crate::{
    data::domain::month_end,
    error::{DataError, EngineResult},
};

/// A strictly increasing sequence of dates forming the row index of a panel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DateGrid {
    dates: Vec<NaiveDate>,
}

impl DateGrid {
    /// Builds a grid from arbitrary dates; duplicates are collapsed and order is normalised.
    pub fn observed(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        let dates = dates.into_iter().sorted_unstable().dedup().collect();
        Self { dates }
    }

    /// Calendar month ends from the month of `first` through the last month end `<= last`.
    pub fn month_ends(first: NaiveDate, last: NaiveDate) -> EngineResult<Self> {
        if first > last {
            return Err(
                DataError::InvalidGrid(format!("grid start {first} is after grid end {last}"))
                    .into(),
            );
        }

        let mut dates = Vec::new();
        let mut cursor = month_end(first);
        while cursor <= last {
            dates.push(cursor);
            match cursor.succ_opt() {
                Some(next_month_start) => cursor = month_end(next_month_start),
                None => break,
            }
        }
        Ok(Self { dates })
    }

    /// The hybrid schedule: the last available date of every month up to `cutover`,
    /// then every available date after it, keeping only dates `>= start`.
    pub fn hybrid(available: &DateGrid, cutover: NaiveDate, start: NaiveDate) -> Self {
        let (monthly, daily): (Vec<NaiveDate>, Vec<NaiveDate>) =
            available.iter().partition(|d| *d <= cutover);

        let by_month = monthly.into_iter().chunk_by(|d| (d.year(), d.month()));
        let month_closes = by_month
            .into_iter()
            .filter_map(|(_, month)| month.last())
            .collect::<Vec<_>>();

        let dates = month_closes
            .into_iter()
            .chain(daily)
            .filter(|d| *d >= start)
            .collect();
        Self { dates }
    }

    /// Keeps only the dates `>= start`.
    pub fn since(&self, start: NaiveDate) -> Self {
        let from = self.dates.partition_point(|d| *d < start);
        Self {
            dates: self.dates[from..].to_vec(),
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn first(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn get(&self, idx: usize) -> Option<NaiveDate> {
        self.dates.get(idx).copied()
    }

    /// Exact row index of `date`, if it lies on the grid.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Index of the last grid date `<= date`.
    pub fn index_at_or_before(&self, date: NaiveDate) -> Option<usize> {
        self.dates.partition_point(|d| *d <= date).checked_sub(1)
    }

    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.dates.iter().copied()
    }
}
