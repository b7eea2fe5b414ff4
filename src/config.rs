use chrono::Duration;

use crate::error::{Error, Result};
use crate::storage::{repository, Database};
use crate::sync::staleness::DEFAULT_MAX_AGE_MINUTES;
use crate::sync::DEFAULT_WINDOW_DAYS;

pub const MAX_AGE_MINUTES_KEY: &str = "max_age_minutes";
pub const DEFAULT_WINDOW_DAYS_KEY: &str = "default_window_days";

/// Tunables read from `app_config`, with defaults for unset keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub max_age: Duration,
    pub default_window_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_age: Duration::minutes(DEFAULT_MAX_AGE_MINUTES),
            default_window_days: DEFAULT_WINDOW_DAYS,
        }
    }
}

impl SyncSettings {
    pub async fn load(db: &Database) -> Result<Self> {
        let entries = db.reader().call(|conn| repository::list_config(conn)).await?;
        let mut settings = Self::default();
        for (key, value) in &entries {
            match key.as_str() {
                MAX_AGE_MINUTES_KEY => {
                    settings.max_age = Duration::minutes(parse_positive(key, value)? as i64)
                }
                DEFAULT_WINDOW_DAYS_KEY => settings.default_window_days = parse_positive(key, value)?,
                _ => {}
            }
        }
        Ok(settings)
    }
}

/// Reject bad values for known keys before they are stored.
pub fn validate(key: &str, value: &str) -> Result<()> {
    match key {
        MAX_AGE_MINUTES_KEY | DEFAULT_WINDOW_DAYS_KEY => parse_positive(key, value).map(|_| ()),
        _ => Ok(()),
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}
