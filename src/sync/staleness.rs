use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::error::Result;
use crate::storage::{repository, Database};

/// Default tolerated cache age before a refresh is due.
pub const DEFAULT_MAX_AGE_MINUTES: i64 = 180;

/// Timestamp format stored in `last_synced_at`. Fixed-width UTC, so the
/// lexical `MAX()` in SQL is also the chronological maximum.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Most recent campaign sync time for the account, if it was ever synced.
///
/// When campaigns disagree (a prior sync partially failed) the newest
/// timestamp represents the account.
pub async fn last_synced_at(db: &Database, account_id: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = db
        .reader()
        .call({
            let account_id = account_id.to_string();
            move |conn| repository::latest_campaign_sync_at(conn, &account_id)
        })
        .await?;

    Ok(raw.as_deref().and_then(|s| {
        let parsed = parse_timestamp(s);
        if parsed.is_none() {
            log::warn!("Unparseable last_synced_at '{s}' for {account_id}; treating as never synced");
        }
        parsed
    }))
}

/// Whether the account's cache is older than `max_age`.
pub async fn should_sync(db: &Database, account_id: &str, max_age: Duration) -> Result<bool> {
    should_sync_at(db, account_id, max_age, Utc::now()).await
}

/// [`should_sync`] evaluated at an explicit instant.
pub async fn should_sync_at(
    db: &Database,
    account_id: &str,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    Ok(is_stale(last_synced_at(db, account_id).await?, max_age, now))
}

pub fn is_stale(last_synced: Option<DateTime<Utc>>, max_age: Duration, now: DateTime<Utc>) -> bool {
    match last_synced {
        None => true,
        Some(last) => now - last > max_age,
    }
}
