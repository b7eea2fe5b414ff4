use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::Serialize;

use crate::date_util::last_day_of_month;
use crate::error::{Error, Result};

/// A date range [start, end] inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidDateRange(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days` calendar days ending on `today` (inclusive).
    pub fn trailing(days: u32, today: NaiveDate) -> Self {
        let days = days.max(1);
        Self {
            start: today - Duration::days(days as i64 - 1),
            end: today,
        }
    }

    /// `[today - years_back years, today]`. Feb 29 clamps to Feb 28.
    pub fn years_back(years_back: u32, today: NaiveDate) -> Self {
        let start = today
            .checked_sub_months(Months::new(years_back.saturating_mul(12)))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end: today }
    }

    /// Number of calendar days covered, always >= 1.
    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, d: NaiveDate) -> bool {
        d >= self.start && d <= self.end
    }

    /// Every calendar day in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Split into month-aligned batches for bounded remote requests.
    pub fn split_into_months(&self) -> Vec<DateRange> {
        let mut batches = Vec::new();
        let mut cursor = self.start;

        while cursor <= self.end {
            let month_end = last_day_of_month(cursor.year(), cursor.month());
            let batch_end = month_end.min(self.end);

            batches.push(DateRange {
                start: cursor,
                end: batch_end,
            });

            cursor = batch_end + Duration::days(1);
        }

        batches
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
