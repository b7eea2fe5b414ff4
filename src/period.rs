use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::Regex;

use crate::date_util::{last_day_of_month, parse_date_key, quarter_of};
use crate::error::{Error, Result};
use crate::range::DateRange;

static RE_QUARTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Q([1-4])$").unwrap());
static RE_WEEK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-W(\d{1,2})$").unwrap());
static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());
static RE_ROLLING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{1,4})[dD]$").unwrap());

/// A reporting window requested by a dashboard caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Period {
    Year(i32),
    Quarter(i32, u8),
    Month(i32, u8),
    Week(i32, u8),
    /// Last N days ending on the given date.
    Rolling(u32, NaiveDate),
    YearToDate(NaiveDate),
    QuarterToDate(NaiveDate),
    MonthToDate(NaiveDate),
    Custom(DateRange),
}

impl Period {
    /// Parse a period string relative to the local calendar day.
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_as_of(s, chrono::Local::now().date_naive())
    }

    /// Parse a period string.
    ///
    /// Supported formats:
    /// - `30d`: rolling last N days ending `today`
    /// - `ytd`, `qtd`, `mtd`: to-date windows ending `today`
    /// - `2025`: year
    /// - `2025-Q1`: quarter
    /// - `2025-01`: month
    /// - `2025-W05`: ISO week
    /// - `2025-01-01..2025-01-31`: explicit inclusive range
    pub fn parse_as_of(s: &str, today: NaiveDate) -> Result<Self> {
        let s = s.trim();

        match s.to_lowercase().as_str() {
            "today" => return Ok(Period::Rolling(1, today)),
            "ytd" => return Ok(Period::YearToDate(today)),
            "qtd" => return Ok(Period::QuarterToDate(today)),
            "mtd" => return Ok(Period::MonthToDate(today)),
            _ => {}
        }

        if let Some(caps) = RE_ROLLING.captures(s) {
            let n: u32 = caps[1]
                .parse()
                .map_err(|_| Error::PeriodParse(format!("invalid day count: {s}")))?;
            if n == 0 {
                return Err(Error::PeriodParse(format!("rolling window must be >= 1 day: {s}")));
            }
            return Ok(Period::Rolling(n, today));
        }

        if let Some((start, end)) = s.split_once("..") {
            let start = parse_date_key(start)
                .ok_or_else(|| Error::PeriodParse(format!("invalid start date: {s}")))?;
            let end = parse_date_key(end)
                .ok_or_else(|| Error::PeriodParse(format!("invalid end date: {s}")))?;
            let range = DateRange::new(start, end)
                .map_err(|e| Error::PeriodParse(e.to_string()))?;
            return Ok(Period::Custom(range));
        }

        // Year: "2025"
        if s.len() == 4 {
            if let Ok(year) = s.parse::<i32>() {
                return Ok(Period::Year(year));
            }
        }

        if let Some(caps) = RE_QUARTER.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let q: u8 = caps[2].parse().unwrap();
            return Ok(Period::Quarter(year, q));
        }

        if let Some(caps) = RE_WEEK.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let week: u8 = caps[2].parse().unwrap();
            if NaiveDate::from_isoywd_opt(year, week as u32, Weekday::Mon).is_some() {
                return Ok(Period::Week(year, week));
            }
        }

        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let month: u8 = caps[2].parse().unwrap();
            if (1..=12).contains(&month) {
                return Ok(Period::Month(year, month));
            }
        }

        Err(Error::PeriodParse(format!("unrecognized period: {s}")))
    }

    /// Canonical key, used in logs and JSON output.
    pub fn to_key(&self) -> String {
        match self {
            Period::Year(y) => format!("{y}"),
            Period::Quarter(y, q) => format!("{y}-Q{q}"),
            Period::Month(y, m) => format!("{y}-{m:02}"),
            Period::Week(y, w) => format!("{y}-W{w:02}"),
            Period::Rolling(n, _) => format!("{n}d"),
            Period::YearToDate(d) => format!("{}-ytd", d.year()),
            Period::QuarterToDate(d) => format!("{}-Q{}-td", d.year(), quarter_of(*d)),
            Period::MonthToDate(d) => format!("{}-{:02}-td", d.year(), d.month()),
            Period::Custom(r) => r.to_string(),
        }
    }

    /// The inclusive date range for this period.
    pub fn date_range(&self) -> DateRange {
        let (start, end) = match self {
            Period::Year(y) => (
                NaiveDate::from_ymd_opt(*y, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(*y, 12, 31).unwrap(),
            ),
            Period::Quarter(y, q) => {
                let start_month = (*q as u32 - 1) * 3 + 1;
                let end_month = *q as u32 * 3;
                (
                    NaiveDate::from_ymd_opt(*y, start_month, 1).unwrap(),
                    last_day_of_month(*y, end_month),
                )
            }
            Period::Month(y, m) => (
                NaiveDate::from_ymd_opt(*y, *m as u32, 1).unwrap(),
                last_day_of_month(*y, *m as u32),
            ),
            Period::Week(y, w) => {
                let start = NaiveDate::from_isoywd_opt(*y, *w as u32, Weekday::Mon).unwrap();
                (start, start + Duration::days(6))
            }
            Period::Rolling(n, as_of) => return DateRange::trailing(*n, *as_of),
            Period::YearToDate(as_of) => (
                NaiveDate::from_ymd_opt(as_of.year(), 1, 1).unwrap(),
                *as_of,
            ),
            Period::QuarterToDate(as_of) => {
                let start_month = (quarter_of(*as_of) as u32 - 1) * 3 + 1;
                (
                    NaiveDate::from_ymd_opt(as_of.year(), start_month, 1).unwrap(),
                    *as_of,
                )
            }
            Period::MonthToDate(as_of) => (
                NaiveDate::from_ymd_opt(as_of.year(), as_of.month(), 1).unwrap(),
                *as_of,
            ),
            Period::Custom(r) => return *r,
        };
        DateRange { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_parse_rolling() {
        let today = d(2025, 3, 31);
        let p = Period::parse_as_of("30d", today).unwrap();
        assert_eq!(p, Period::Rolling(30, today));
        let r = p.date_range();
        assert_eq!(r.start, d(2025, 3, 2));
        assert_eq!(r.end, today);
        assert!(Period::parse_as_of("0d", today).is_err());
    }

    #[test]
    fn test_parse_to_date() {
        let today = d(2025, 5, 20);
        assert_eq!(
            Period::parse_as_of("mtd", today).unwrap().date_range(),
            DateRange { start: d(2025, 5, 1), end: today }
        );
        assert_eq!(
            Period::parse_as_of("QTD", today).unwrap().date_range(),
            DateRange { start: d(2025, 4, 1), end: today }
        );
        assert_eq!(
            Period::parse_as_of("ytd", today).unwrap().date_range(),
            DateRange { start: d(2025, 1, 1), end: today }
        );
    }

    #[test]
    fn test_parse_calendar_periods() {
        let today = d(2025, 5, 20);
        assert_eq!(
            Period::parse_as_of("2024", today).unwrap().date_range(),
            DateRange { start: d(2024, 1, 1), end: d(2024, 12, 31) }
        );
        assert_eq!(
            Period::parse_as_of("2025-Q1", today).unwrap().date_range(),
            DateRange { start: d(2025, 1, 1), end: d(2025, 3, 31) }
        );
        assert_eq!(
            Period::parse_as_of("2024-02", today).unwrap().date_range(),
            DateRange { start: d(2024, 2, 1), end: d(2024, 2, 29) }
        );
        let week = Period::parse_as_of("2025-W02", today).unwrap().date_range();
        assert_eq!(week.start, d(2025, 1, 6));
        assert_eq!(week.num_days(), 7);
    }

    #[test]
    fn test_parse_custom_range() {
        let p = Period::parse_as_of("2025-01-10..2025-01-12", d(2025, 5, 20)).unwrap();
        assert_eq!(p.date_range().num_days(), 3);
        assert_eq!(p.to_key(), "2025-01-10..2025-01-12");

        assert!(Period::parse_as_of("2025-01-12..2025-01-10", d(2025, 5, 20)).is_err());
        assert!(Period::parse_as_of("2025-01-xx..2025-01-10", d(2025, 5, 20)).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let today = d(2025, 5, 20);
        assert!(Period::parse_as_of("last fortnight", today).is_err());
        assert!(Period::parse_as_of("2025-13", today).is_err());
        assert!(Period::parse_as_of("2025-Q5", today).is_err());
    }
}
