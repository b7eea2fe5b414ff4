use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// Scale of the reporting API's fixed-point money unit (micros).
pub const MICROS_PER_UNIT: u32 = 6;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap() - Duration::days(1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap() - Duration::days(1)
    }
}

/// Get the quarter (1-4) for a given date.
pub fn quarter_of(d: NaiveDate) -> u8 {
    ((d.month() - 1) / 3 + 1) as u8
}

/// Format a date as the `YYYY-MM-DD` key used in the store.
pub fn date_key(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

/// Parse a `YYYY-MM-DD` date key.
pub fn parse_date_key(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

/// Round to two decimal places, half away from zero.
///
/// Idempotent: `round2(round2(x)) == round2(x)`, so re-syncing the same
/// value never drifts.
pub fn round2(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    Decimal::from_f64(value)
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(0.0)
}

/// Convert a micros amount to currency units rounded to cents.
pub fn micros_to_currency(micros: i64) -> f64 {
    Decimal::new(micros, MICROS_PER_UNIT)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(0.0)
}

/// `numerator / denominator`, or 0 when the denominator is 0.
pub fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
