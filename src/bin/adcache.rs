use std::sync::Arc;

use clap::{Parser, Subcommand};

use adcache::{AccountStatus, AdCache, ConnectionParams, HttpClientFactory, Period};

const ACCESS_TOKEN_ENV: &str = "ADCACHE_ACCESS_TOKEN";

#[derive(Parser)]
#[command(name = "adcache", about = "Ad campaign metrics cache")]
struct Cli {
    /// Database path (default: ~/.adcache/adcache.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Request timeout for the reporting API, in seconds
    #[arg(long, default_value = "60")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl adcache::SyncProgress for StderrProgress {
    fn on_account_start(&self, account_id: &str, index: usize, total: usize) {
        eprintln!("[{}/{}] Syncing {}...", index + 1, total, account_id);
    }

    fn on_campaigns_fetched(&self, _account_id: &str, count: usize) {
        eprintln!("  Fetched {count} campaigns");
    }

    fn on_metrics_fetched(&self, _account_id: &str, batch: &adcache::DateRange, count: usize) {
        eprintln!("  Fetched {count} metric rows for {batch}");
    }

    fn on_account_complete(&self, outcome: &adcache::SyncOutcome) {
        eprintln!("  Done: {}", outcome.status.as_str());
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Manage ad account connections
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Sync remote data into the local cache
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },
    /// Show aggregated metrics for an account
    Metrics {
        /// Account id
        account_id: String,
        /// Period: 7d, 30d, mtd, qtd, ytd, 2025, 2025-Q1, 2025-03, 2025-W10,
        /// or 2025-01-01..2025-01-31
        #[arg(long, default_value = "30d")]
        period: String,
        /// Refresh from the remote API even if the cache is fresh
        #[arg(long)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show cache status and recent sync activity
    Status,
}

#[derive(Subcommand)]
enum AccountAction {
    /// Add or update an account connection
    Add {
        /// Local id for the account
        account_id: String,
        /// Reporting API base URL
        #[arg(long)]
        base_url: String,
        /// Remote customer id
        #[arg(long)]
        customer_id: String,
        /// Manager account id, when accessing through a manager
        #[arg(long)]
        login_customer_id: Option<String>,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Access token (default: $ADCACHE_ACCESS_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },
    /// List account connections
    List,
    /// Remove an account connection (cached data is kept)
    Remove { account_id: String },
    /// Set an account's status: active, inactive, error
    Status {
        account_id: String,
        status: String,
    },
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Full sync of one account
    Account {
        account_id: String,
        /// Number of days to look back
        #[arg(long)]
        days: Option<u32>,
        /// Sync metrics since this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
    },
    /// Full sync of every active account
    All {
        #[arg(long)]
        days: Option<u32>,
        #[arg(long)]
        since: Option<String>,
        /// Sync accounts whose cache is still fresh
        #[arg(long)]
        force: bool,
    },
    /// Backfill an account's history
    History {
        account_id: String,
        /// Years to go back
        #[arg(long, default_value = "2")]
        years: u32,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

fn parse_since(since: Option<&str>) -> anyhow::Result<Option<chrono::NaiveDate>> {
    since
        .map(|s| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| anyhow::anyhow!("invalid --since '{s}': {e}"))
        })
        .transpose()
}

fn make_sync_options(
    days: Option<u32>,
    since: Option<&str>,
    force: bool,
) -> anyhow::Result<adcache::SyncOptions> {
    Ok(adcache::SyncOptions {
        since: parse_since(since)?,
        until: None,
        days,
        force,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => adcache::Database::open_at(path).await?,
        None => adcache::Database::open().await?,
    };
    let clients = Arc::new(HttpClientFactory::with_timeout(cli.timeout)?);
    let cache = AdCache::with_stored_credentials(db, clients);

    match cli.command {
        Commands::Account { action } => handle_account(&cache, action).await?,
        Commands::Sync { target } => handle_sync(&cache, target).await?,
        Commands::Metrics {
            account_id,
            period,
            force,
            json,
        } => handle_metrics(&cache, &account_id, &period, force, json).await?,
        Commands::Config { action } => handle_config(&cache, action).await?,
        Commands::Status => print_status(&cache).await?,
    }

    cache.flush_activity().await;
    Ok(())
}

async fn handle_account(cache: &AdCache, action: AccountAction) -> anyhow::Result<()> {
    match action {
        AccountAction::Add {
            account_id,
            base_url,
            customer_id,
            login_customer_id,
            name,
            token,
        } => {
            let access_token = match token {
                Some(t) => t,
                None => std::env::var(ACCESS_TOKEN_ENV).map_err(|_| {
                    anyhow::anyhow!("no access token: pass --token or set {ACCESS_TOKEN_ENV}")
                })?,
            };
            let params = ConnectionParams {
                base_url,
                customer_id,
                access_token,
                login_customer_id,
            };
            cache.add_account(&account_id, name.as_deref(), &params).await?;
            println!("Added: {account_id}");
        }
        AccountAction::List => {
            let accounts = cache.list_accounts().await?;
            if accounts.is_empty() {
                println!("No accounts. Use 'account add' first.");
            }
            for account in accounts {
                let health = cache.account_health(&account.account_id).await?;
                let last = health
                    .as_ref()
                    .and_then(|h| h.last_success_at.as_deref())
                    .unwrap_or("never");
                println!(
                    "{} {} [{}] (last success: {})",
                    account.account_id,
                    account.display_name.as_deref().unwrap_or(""),
                    account.status.as_str(),
                    last
                );
                if let Some(err) = health.as_ref().and_then(|h| h.last_error.as_deref()) {
                    println!("  Last error: {err}");
                }
            }
        }
        AccountAction::Remove { account_id } => {
            if cache.remove_account(&account_id).await? {
                println!("Removed: {account_id}");
            } else {
                println!("Not found: {account_id}");
            }
        }
        AccountAction::Status { account_id, status } => {
            let status = AccountStatus::parse(&status)
                .ok_or_else(|| anyhow::anyhow!("unknown status '{status}' (active, inactive, error)"))?;
            cache.set_account_status(&account_id, status).await?;
            println!("{account_id} is now {}", status.as_str());
        }
    }
    Ok(())
}

async fn handle_sync(cache: &AdCache, target: SyncTarget) -> anyhow::Result<()> {
    match target {
        SyncTarget::Account {
            account_id,
            days,
            since,
        } => {
            let options = make_sync_options(days, since.as_deref(), true)?;
            let outcome = cache
                .syncer(&account_id)
                .await?
                .with_progress(Arc::new(StderrProgress))
                .perform_full_sync(&options)
                .await;
            print_sync_report(&outcome);
        }
        SyncTarget::All { days, since, force } => {
            let options = make_sync_options(days, since.as_deref(), force)?;
            let outcomes = cache
                .sync_all_configurations(&options, Arc::new(StderrProgress))
                .await;
            for outcome in &outcomes {
                print_sync_report(outcome);
                println!();
            }
            if outcomes.is_empty() {
                println!("No active accounts to sync. Use 'account add' first.");
            }
        }
        SyncTarget::History { account_id, years } => {
            let outcome = cache
                .syncer(&account_id)
                .await?
                .with_progress(Arc::new(StderrProgress))
                .sync_historical_data(years)
                .await;
            print_sync_report(&outcome);
        }
    }
    Ok(())
}

async fn handle_metrics(
    cache: &AdCache,
    account_id: &str,
    period: &str,
    force: bool,
    json: bool,
) -> anyhow::Result<()> {
    let range = Period::parse(period)?.date_range();
    let view = cache.get_metrics(account_id, range, force).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let source = match view.provenance {
        adcache::Provenance::Cache => match view.cache_age_ms {
            Some(ms) => format!("cache, {} min old", ms / 60_000),
            None => "cache".to_string(),
        },
        adcache::Provenance::LiveFallback => "live".to_string(),
    };
    println!("Metrics: {} ({}) [{source}]", view.account_id, view.range);
    print_totals("  ", &view.totals);

    if !view.campaigns.is_empty() {
        println!("  Campaigns:");
        for c in &view.campaigns {
            println!("    {} [{}]", c.name, c.status.as_str());
            print_totals("      ", &c.totals);
        }
    }

    let active_days = view.daily.iter().filter(|p| p.totals.impressions > 0).count();
    println!("  Days with impressions: {active_days}/{}", view.daily.len());
    Ok(())
}

fn print_totals(indent: &str, t: &adcache::MetricTotals) {
    println!(
        "{indent}Impressions: {}  Clicks: {}  CTR: {:.2}%",
        t.impressions, t.clicks, t.ctr
    );
    println!(
        "{indent}Conversions: {:.2}  Conv. rate: {:.2}%  Cost: {:.2}  CPC: {:.2}  CPA: {:.2}",
        t.conversions, t.conversion_rate, t.cost, t.average_cpc, t.cost_per_conversion
    );
}

async fn handle_config(cache: &AdCache, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match cache.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            cache.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = cache.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

async fn print_status(cache: &AdCache) -> anyhow::Result<()> {
    let (accounts, campaigns, rows) = cache
        .db()
        .reader()
        .call(|conn| {
            let accounts: i64 =
                conn.query_row("SELECT COUNT(*) FROM account_configs", [], |row| row.get(0))?;
            let campaigns: i64 =
                conn.query_row("SELECT COUNT(*) FROM campaigns", [], |row| row.get(0))?;
            let rows: i64 =
                conn.query_row("SELECT COUNT(*) FROM daily_metrics", [], |row| row.get(0))?;
            Ok::<_, rusqlite::Error>((accounts, campaigns, rows))
        })
        .await?;
    let settings = cache.settings().await?;

    println!("Cache Status");
    println!("  Accounts:     {accounts}");
    println!("  Campaigns:    {campaigns}");
    println!("  Metric rows:  {rows}");
    println!("  Max age:      {} min", settings.max_age.num_minutes());

    let activity = cache.recent_activity(10).await?;
    if !activity.is_empty() {
        println!("  Recent activity:");
        for entry in activity {
            println!(
                "    {} {} {} {} ({} campaigns, {} rows, {} errors, {}ms)",
                entry.completed_at,
                entry.account_id,
                entry.stage,
                entry.status,
                entry.campaigns_written,
                entry.metrics_written,
                entry.error_count,
                entry.duration_ms
            );
        }
    }
    Ok(())
}

fn print_sync_report(outcome: &adcache::SyncOutcome) {
    println!("Sync: {} ({})", outcome.account_id, outcome.stage.as_str());
    println!("  Status:    {}", outcome.status.as_str());
    println!("  Campaigns: {}", outcome.campaigns_written);
    println!("  Metrics:   {} rows", outcome.metrics_written);
    println!("  Duration:  {}ms", outcome.duration_ms());
    for err in &outcome.errors {
        println!("  Error:     {err}");
    }
}
