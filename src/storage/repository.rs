use std::collections::HashMap;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::date_util::date_key;
use crate::models::{AccountStatus, CampaignStatus, DerivedRates};

// ── Account configurations ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub account_id: String,
    pub display_name: Option<String>,
    pub status: AccountStatus,
    pub connection_json: String,
    pub created_at: String,
    pub updated_at: String,
}

fn account_from_row(row: &Row<'_>) -> Result<AccountConfig, rusqlite::Error> {
    let status: String = row.get(2)?;
    Ok(AccountConfig {
        account_id: row.get(0)?,
        display_name: row.get(1)?,
        status: AccountStatus::parse(&status).unwrap_or(AccountStatus::Error),
        connection_json: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Insert or replace the connection details for an account.
/// Reconnecting an existing account keeps its `created_at`.
pub fn upsert_account_config(
    conn: &Connection,
    account_id: &str,
    display_name: Option<&str>,
    status: AccountStatus,
    connection_json: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO account_configs (account_id, display_name, status, connection_json)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(account_id) DO UPDATE SET
           display_name = COALESCE(excluded.display_name, account_configs.display_name),
           status = excluded.status,
           connection_json = excluded.connection_json,
           updated_at = datetime('now')",
        params![account_id, display_name, status.as_str(), connection_json],
    )?;
    Ok(())
}

pub fn get_account_config(
    conn: &Connection,
    account_id: &str,
) -> Result<Option<AccountConfig>, rusqlite::Error> {
    conn.query_row(
        "SELECT account_id, display_name, status, connection_json, created_at, updated_at
         FROM account_configs WHERE account_id = ?1",
        params![account_id],
        account_from_row,
    )
    .optional()
}

pub fn list_account_configs(conn: &Connection) -> Result<Vec<AccountConfig>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT account_id, display_name, status, connection_json, created_at, updated_at
         FROM account_configs ORDER BY created_at, account_id",
    )?;
    let rows = stmt.query_map([], account_from_row)?;
    rows.collect()
}

pub fn list_active_account_ids(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT account_id FROM account_configs WHERE status = 'active'
         ORDER BY created_at, account_id",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

pub fn set_account_status(
    conn: &Connection,
    account_id: &str,
    status: AccountStatus,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE account_configs SET status = ?2, updated_at = datetime('now')
         WHERE account_id = ?1",
        params![account_id, status.as_str()],
    )?;
    Ok(count > 0)
}

/// Remove an account configuration. Cached campaigns and metrics are kept.
pub fn remove_account_config(conn: &Connection, account_id: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM account_configs WHERE account_id = ?1",
        params![account_id],
    )?;
    Ok(count > 0)
}

// ── Sync health ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncHealth {
    pub last_attempt_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error: Option<String>,
}

/// Record the result of a full sync attempt. A success clears `last_error`.
/// No-op for accounts without a configuration row.
pub fn record_sync_health(
    conn: &Connection,
    account_id: &str,
    attempted_at: &str,
    error: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO account_sync_health (account_id, last_attempt_at, last_success_at, last_error)
         SELECT ?1, ?2, CASE WHEN ?3 IS NULL THEN ?2 END, ?3
         WHERE EXISTS (SELECT 1 FROM account_configs WHERE account_id = ?1)
         ON CONFLICT(account_id) DO UPDATE SET
           last_attempt_at = excluded.last_attempt_at,
           last_success_at = COALESCE(excluded.last_success_at, account_sync_health.last_success_at),
           last_error = excluded.last_error",
        params![account_id, attempted_at, error],
    )?;
    Ok(())
}

pub fn get_sync_health(
    conn: &Connection,
    account_id: &str,
) -> Result<Option<SyncHealth>, rusqlite::Error> {
    conn.query_row(
        "SELECT last_attempt_at, last_success_at, last_error
         FROM account_sync_health WHERE account_id = ?1",
        params![account_id],
        |row| {
            Ok(SyncHealth {
                last_attempt_at: row.get(0)?,
                last_success_at: row.get(1)?,
                last_error: row.get(2)?,
            })
        },
    )
    .optional()
}

// ── Campaigns ──────────────────────────────────────────────────────

/// A validated campaign ready to be written.
#[derive(Debug, Clone)]
pub struct CampaignUpsert {
    pub account_id: String,
    pub remote_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub budget: Option<f64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub synced_at: String,
}

#[derive(Debug, Clone)]
pub struct StoredCampaign {
    pub id: i64,
    pub account_id: String,
    pub remote_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub budget: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub last_synced_at: String,
}

/// Upsert keyed by (account_id, remote_id). Every mutable field is
/// overwritten; the local id is stable across syncs.
pub fn upsert_campaign(conn: &Connection, c: &CampaignUpsert) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO campaigns (
            account_id, remote_id, name, status, budget, start_date, end_date, last_synced_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(account_id, remote_id) DO UPDATE SET
            name=excluded.name, status=excluded.status, budget=excluded.budget,
            start_date=excluded.start_date, end_date=excluded.end_date,
            last_synced_at=excluded.last_synced_at",
        params![
            c.account_id,
            c.remote_id,
            c.name,
            c.status.as_str(),
            c.budget,
            c.start_date.map(date_key),
            c.end_date.map(date_key),
            c.synced_at,
        ],
    )?;
    Ok(())
}

pub fn list_campaigns(
    conn: &Connection,
    account_id: &str,
) -> Result<Vec<StoredCampaign>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, remote_id, name, status, budget, start_date, end_date, last_synced_at
         FROM campaigns WHERE account_id = ?1 ORDER BY name, remote_id",
    )?;
    let rows = stmt.query_map(params![account_id], |row| {
        let status: String = row.get(4)?;
        Ok(StoredCampaign {
            id: row.get(0)?,
            account_id: row.get(1)?,
            remote_id: row.get(2)?,
            name: row.get(3)?,
            status: CampaignStatus::from_remote(&status),
            budget: row.get(5)?,
            start_date: row.get(6)?,
            end_date: row.get(7)?,
            last_synced_at: row.get(8)?,
        })
    })?;
    rows.collect()
}

/// Map of remote campaign id → local campaign id for an account.
pub fn campaign_ids_by_remote(
    conn: &Connection,
    account_id: &str,
) -> Result<HashMap<String, i64>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT remote_id, id FROM campaigns WHERE account_id = ?1")?;
    let rows = stmt.query_map(params![account_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

pub fn count_campaigns(conn: &Connection, account_id: &str) -> Result<u64, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM campaigns WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Most recent `last_synced_at` across the account's campaigns.
pub fn latest_campaign_sync_at(
    conn: &Connection,
    account_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT MAX(last_synced_at) FROM campaigns WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )
}

// ── Daily metrics ──────────────────────────────────────────────────

/// A validated daily metric row ready to be written.
#[derive(Debug, Clone)]
pub struct DailyMetricUpsert {
    pub campaign_id: i64,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: f64,
    pub cost: f64,
    pub rates: DerivedRates,
    pub synced_at: String,
}

#[derive(Debug, Clone)]
pub struct StoredDailyMetric {
    pub campaign_id: i64,
    pub campaign_remote_id: String,
    pub date: String,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: f64,
    pub cost: f64,
    pub rates: DerivedRates,
    pub synced_at: String,
}

/// Upsert keyed by (campaign_id, date). Last write wins: restated upstream
/// values replace the stored row wholesale.
pub fn upsert_daily_metric(
    conn: &Connection,
    m: &DailyMetricUpsert,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO daily_metrics (
            campaign_id, date, impressions, clicks, conversions, cost,
            ctr, average_cpc, conversion_rate, synced_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(campaign_id, date) DO UPDATE SET
            impressions=excluded.impressions, clicks=excluded.clicks,
            conversions=excluded.conversions, cost=excluded.cost,
            ctr=excluded.ctr, average_cpc=excluded.average_cpc,
            conversion_rate=excluded.conversion_rate, synced_at=excluded.synced_at",
        params![
            m.campaign_id,
            date_key(m.date),
            m.impressions as i64,
            m.clicks as i64,
            m.conversions,
            m.cost,
            m.rates.ctr,
            m.rates.average_cpc,
            m.rates.conversion_rate,
            m.synced_at,
        ],
    )?;
    Ok(())
}

/// Stored daily rows for an account's campaigns within [start, end].
pub fn list_daily_metrics(
    conn: &Connection,
    account_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<StoredDailyMetric>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT m.campaign_id, c.remote_id, m.date, m.impressions, m.clicks, m.conversions,
                m.cost, m.ctr, m.average_cpc, m.conversion_rate, m.synced_at
         FROM daily_metrics m
         JOIN campaigns c ON c.id = m.campaign_id
         WHERE c.account_id = ?1 AND m.date >= ?2 AND m.date <= ?3
         ORDER BY m.date, c.remote_id",
    )?;
    let rows = stmt.query_map(params![account_id, date_key(start), date_key(end)], |row| {
        Ok(StoredDailyMetric {
            campaign_id: row.get(0)?,
            campaign_remote_id: row.get(1)?,
            date: row.get(2)?,
            impressions: row.get::<_, i64>(3)?.max(0) as u64,
            clicks: row.get::<_, i64>(4)?.max(0) as u64,
            conversions: row.get(5)?,
            cost: row.get(6)?,
            rates: DerivedRates {
                ctr: row.get(7)?,
                average_cpc: row.get(8)?,
                conversion_rate: row.get(9)?,
            },
            synced_at: row.get(10)?,
        })
    })?;
    rows.collect()
}

pub fn count_daily_metrics(conn: &Connection, account_id: &str) -> Result<u64, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM daily_metrics m
         JOIN campaigns c ON c.id = m.campaign_id
         WHERE c.account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

// ── Activity log ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncLogEntry {
    pub account_id: String,
    pub stage: String,
    pub status: String,
    pub campaigns_written: u64,
    pub metrics_written: u64,
    pub error_count: u64,
    pub first_error: Option<String>,
    pub started_at: String,
    pub completed_at: String,
    pub duration_ms: i64,
}

pub fn insert_sync_log(conn: &Connection, entry: &SyncLogEntry) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_log (
            account_id, stage, status, campaigns_written, metrics_written,
            error_count, first_error, started_at, completed_at, duration_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.account_id,
            entry.stage,
            entry.status,
            entry.campaigns_written as i64,
            entry.metrics_written as i64,
            entry.error_count as i64,
            entry.first_error,
            entry.started_at,
            entry.completed_at,
            entry.duration_ms,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_recent_sync_log(
    conn: &Connection,
    limit: u32,
) -> Result<Vec<SyncLogEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT account_id, stage, status, campaigns_written, metrics_written,
                error_count, first_error, started_at, completed_at, duration_ms
         FROM sync_log ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SyncLogEntry {
            account_id: row.get(0)?,
            stage: row.get(1)?,
            status: row.get(2)?,
            campaigns_written: row.get::<_, i64>(3)? as u64,
            metrics_written: row.get::<_, i64>(4)? as u64,
            error_count: row.get::<_, i64>(5)? as u64,
            first_error: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            duration_ms: row.get(9)?,
        })
    })?;
    rows.collect()
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn campaign(account_id: &str, remote_id: &str, name: &str, synced_at: &str) -> CampaignUpsert {
        CampaignUpsert {
            account_id: account_id.to_string(),
            remote_id: remote_id.to_string(),
            name: name.to_string(),
            status: CampaignStatus::Enabled,
            budget: Some(100.0),
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1),
            end_date: None,
            synced_at: synced_at.to_string(),
        }
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "max_age_minutes", "90")?;
                let val = get_config(conn, "max_age_minutes")?;
                assert_eq!(val, Some("90".to_string()));

                let missing = get_config(conn, "nonexistent")?;
                assert_eq!(missing, None);

                assert_eq!(list_config(conn)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_account_config_crud() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_account_config(conn, "acme", Some("Acme"), AccountStatus::Active, "{}")?;
                upsert_account_config(conn, "globex", None, AccountStatus::Active, "{}")?;
                upsert_account_config(conn, "initech", None, AccountStatus::Inactive, "{}")?;

                assert_eq!(list_account_configs(conn)?.len(), 3);
                assert_eq!(list_active_account_ids(conn)?, vec!["acme", "globex"]);

                // Reconnecting keeps the display name when none is given
                upsert_account_config(conn, "acme", None, AccountStatus::Active, "{\"v\":2}")?;
                let acme = get_account_config(conn, "acme")?.unwrap();
                assert_eq!(acme.display_name.as_deref(), Some("Acme"));
                assert_eq!(acme.connection_json, "{\"v\":2}");

                assert!(set_account_status(conn, "globex", AccountStatus::Error)?);
                assert_eq!(list_active_account_ids(conn)?, vec!["acme"]);
                assert!(!set_account_status(conn, "nobody", AccountStatus::Active)?);

                assert!(remove_account_config(conn, "initech")?);
                assert!(get_account_config(conn, "initech")?.is_none());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_campaign_keeps_single_row() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_campaign(conn, &campaign("acme", "c1", "Spring", "2025-01-01T00:00:00Z"))?;
                let first_id = campaign_ids_by_remote(conn, "acme")?["c1"];

                let mut renamed = campaign("acme", "c1", "Spring Sale", "2025-01-02T00:00:00Z");
                renamed.status = CampaignStatus::Paused;
                upsert_campaign(conn, &renamed)?;

                let stored = list_campaigns(conn, "acme")?;
                assert_eq!(stored.len(), 1);
                assert_eq!(stored[0].id, first_id);
                assert_eq!(stored[0].name, "Spring Sale");
                assert_eq!(stored[0].status, CampaignStatus::Paused);
                assert_eq!(stored[0].start_date.as_deref(), Some("2025-01-01"));

                // Same remote id under another account is a different campaign
                upsert_campaign(conn, &campaign("globex", "c1", "Other", "2025-01-02T00:00:00Z"))?;
                assert_eq!(count_campaigns(conn, "acme")?, 1);
                assert_eq!(count_campaigns(conn, "globex")?, 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_latest_campaign_sync_at_uses_maximum() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert_eq!(latest_campaign_sync_at(conn, "acme")?, None);

                upsert_campaign(conn, &campaign("acme", "c1", "A", "2025-01-01T08:00:00Z"))?;
                upsert_campaign(conn, &campaign("acme", "c2", "B", "2025-01-03T08:00:00Z"))?;
                upsert_campaign(conn, &campaign("acme", "c3", "C", "2025-01-02T08:00:00Z"))?;

                assert_eq!(
                    latest_campaign_sync_at(conn, "acme")?,
                    Some("2025-01-03T08:00:00Z".to_string())
                );
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_daily_metric_upsert_and_range_query() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_campaign(conn, &campaign("acme", "c1", "A", "2025-01-01T00:00:00Z"))?;
                let cid = campaign_ids_by_remote(conn, "acme")?["c1"];

                for day in 1..=3 {
                    upsert_daily_metric(
                        conn,
                        &DailyMetricUpsert {
                            campaign_id: cid,
                            date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
                            impressions: 100,
                            clicks: 10,
                            conversions: 1.0,
                            cost: 5.0,
                            rates: DerivedRates::compute(100, 10, 1.0, 5.0),
                            synced_at: "2025-01-04T00:00:00Z".to_string(),
                        },
                    )?;
                }

                let rows = list_daily_metrics(
                    conn,
                    "acme",
                    NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
                    NaiveDate::from_ymd_opt(2025, 1, 3).unwrap(),
                )?;
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].date, "2025-01-02");
                assert_eq!(rows[0].campaign_remote_id, "c1");
                assert_eq!(rows[0].rates.ctr, 10.0);
                assert_eq!(count_daily_metrics(conn, "acme")?, 3);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_health_records_success_and_failure() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_account_config(conn, "acme", None, AccountStatus::Active, "{}")?;

                record_sync_health(conn, "acme", "2025-01-01T00:00:00Z", None)?;
                record_sync_health(conn, "acme", "2025-01-02T00:00:00Z", Some("quota exceeded"))?;

                let health = get_sync_health(conn, "acme")?.unwrap();
                assert_eq!(health.last_attempt_at.as_deref(), Some("2025-01-02T00:00:00Z"));
                assert_eq!(health.last_success_at.as_deref(), Some("2025-01-01T00:00:00Z"));
                assert_eq!(health.last_error.as_deref(), Some("quota exceeded"));

                record_sync_health(conn, "acme", "2025-01-03T00:00:00Z", None)?;
                let health = get_sync_health(conn, "acme")?.unwrap();
                assert_eq!(health.last_success_at.as_deref(), Some("2025-01-03T00:00:00Z"));
                assert_eq!(health.last_error, None);

                // Unknown accounts are ignored rather than violating the FK
                record_sync_health(conn, "ghost", "2025-01-03T00:00:00Z", None)?;
                assert!(get_sync_health(conn, "ghost")?.is_none());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_log_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let id = insert_sync_log(
                    conn,
                    &SyncLogEntry {
                        account_id: "acme".to_string(),
                        stage: "full_sync".to_string(),
                        status: "partial_failure".to_string(),
                        campaigns_written: 3,
                        metrics_written: 90,
                        error_count: 1,
                        first_error: Some("bad date".to_string()),
                        started_at: "2025-01-01T00:00:00Z".to_string(),
                        completed_at: "2025-01-01T00:00:02Z".to_string(),
                        duration_ms: 2000,
                    },
                )?;
                assert!(id > 0);

                let entries = list_recent_sync_log(conn, 10)?;
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].metrics_written, 90);
                assert_eq!(entries[0].first_error.as_deref(), Some("bad date"));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
