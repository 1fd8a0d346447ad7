//! Canonbar CLI: backfill, asset registry, task ledger and store management.
//!
//! Commands:
//! - `backfill` fetch, reconcile and write canonical daily records
//! - `assets register|deactivate|list` manage the asset registry
//! - `tasks status|ack` inspect the task ledger, acknowledge failures
//! - `store status|migrate` inspect and upgrade on-disk table versions
//! - `review list` print logged discrepancy flags

use anyhow::{bail, Context, Result};
use canonbar_core::adapter::build_adapters;
use canonbar_core::domain::{Asset, AssetId, AssetType, SourceId, TaskKey};
use canonbar_core::review::JsonlReviewLog;
use canonbar_core::store::{AssetRegistry, ParquetStore};
use canonbar_core::PipelineConfig;
use canonbar_runner::{BackfillRequest, CancelHandle, Orchestrator, TaskLedger, TaskStatus};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const REVIEW_LOG: &str = "review.jsonl";

#[derive(Parser)]
#[command(
    name = "canonbar",
    about = "Canonbar: multi-source daily price backfill into a canonical store"
)]
struct Cli {
    /// Pipeline config (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store directory. Overrides `[store] root` from the config.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, reconcile and write canonical records for assets over a day range.
    Backfill {
        /// Comma-separated asset ids (e.g. btc,eth).
        #[arg(long, required = true, value_delimiter = ',')]
        assets: Vec<String>,

        /// First day (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// Last day, inclusive (YYYY-MM-DD).
        #[arg(long)]
        end: String,

        /// Re-fetch tasks already done or acknowledged.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Write the run report here (`.csv` for CSV, JSON otherwise).
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Asset registry commands.
    Assets {
        #[command(subcommand)]
        action: AssetsAction,
    },
    /// Task ledger commands.
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },
    /// Store schema commands.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
    /// Discrepancy review commands.
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },
}

#[derive(Subcommand)]
enum AssetsAction {
    /// Register a new asset.
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        symbol: String,
        /// coin, token, stablecoin, fiat or other.
        #[arg(long = "type", default_value = "coin")]
        asset_type: String,
    },
    /// Exclude an asset from future backfills. History is kept.
    Deactivate {
        #[arg(long)]
        id: String,
    },
    /// List registered assets.
    List,
}

#[derive(Subcommand)]
enum TasksAction {
    /// Summarize the task ledger.
    Status {
        /// List only failed tasks.
        #[arg(long, default_value_t = false)]
        failed: bool,
    },
    /// Acknowledge a failed task so it no longer blocks run success.
    Ack {
        #[arg(long)]
        asset: String,
        #[arg(long)]
        day: String,
        #[arg(long)]
        source: String,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// Report stored table versions and partition counts.
    Status,
    /// Bring stored tables to the current schema version.
    Migrate,
}

#[derive(Subcommand)]
enum ReviewAction {
    /// Print discrepancy flags from the review log.
    List {
        /// Review log file. Defaults to `review.jsonl` in the store directory.
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let root = cli.store.unwrap_or_else(|| config.store.root.clone());

    match cli.command {
        Commands::Backfill {
            assets,
            start,
            end,
            force,
            report,
        } => run_backfill(config, &root, assets, &start, &end, force, report),
        Commands::Assets { action } => match action {
            AssetsAction::Register {
                id,
                symbol,
                asset_type,
            } => run_assets_register(&root, id, symbol, &asset_type),
            AssetsAction::Deactivate { id } => run_assets_deactivate(&root, id),
            AssetsAction::List => run_assets_list(&root),
        },
        Commands::Tasks { action } => match action {
            TasksAction::Status { failed } => run_tasks_status(&root, failed),
            TasksAction::Ack { asset, day, source } => run_tasks_ack(&root, asset, &day, source),
        },
        Commands::Store { action } => match action {
            StoreAction::Status => run_store_status(&root),
            StoreAction::Migrate => run_store_migrate(&root),
        },
        Commands::Review { action } => match action {
            ReviewAction::List { log } => {
                run_review_list(&log.unwrap_or_else(|| root.join(REVIEW_LOG)))
            }
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid day '{s}'"))
}

fn open_store(root: &Path) -> Result<ParquetStore> {
    ParquetStore::open(root).with_context(|| format!("opening store {}", root.display()))
}

fn run_backfill(
    config: PipelineConfig,
    root: &Path,
    assets: Vec<String>,
    start: &str,
    end: &str,
    force: bool,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let request = BackfillRequest::new(
        assets.into_iter().map(AssetId::new),
        parse_day(start)?,
        parse_day(end)?,
    )?
    .with_force(force);

    let adapters = build_adapters(&config).context("building source adapters")?;
    if adapters.is_empty() {
        bail!("no [[sources]] configured; pass --config with at least one source");
    }
    let store = Arc::new(open_store(root)?);
    let mut ledger = TaskLedger::in_dir(root).context("loading task ledger")?;
    let review = Arc::new(JsonlReviewLog::new(root.join(REVIEW_LOG)));

    let orchestrator = Orchestrator::new(config, store, adapters).with_review_sink(review);
    let report = orchestrator.run(&request, &mut ledger, &CancelHandle::new())?;

    println!("{}", report.summary());
    for task in report.tasks.iter().filter(|t| !t.is_settled()) {
        println!(
            "  {} {} {}: {} after {} attempt(s){}",
            task.key.asset_id,
            task.key.day,
            task.key.source,
            task.status,
            task.attempt_count,
            task.last_error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default(),
        );
    }
    for failure in &report.write_failures {
        println!(
            "  write failed for {} {}: {}",
            failure.key.asset_id, failure.key.day, failure.error
        );
    }
    if !report.inactive_assets.is_empty() {
        let ids: Vec<&str> = report.inactive_assets.iter().map(|a| a.as_str()).collect();
        println!("Skipped inactive assets: {}", ids.join(", "));
    }

    if let Some(path) = report_path {
        report
            .write_to(&path)
            .with_context(|| format!("writing report {}", path.display()))?;
        println!("Report saved to: {}", path.display());
    }

    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_assets_register(root: &Path, id: String, symbol: String, asset_type: &str) -> Result<()> {
    let asset_type: AssetType = asset_type.parse().map_err(anyhow::Error::msg)?;
    let store = open_store(root)?;
    let asset = Asset::new(id, symbol, asset_type, Utc::now());
    store
        .register(asset.clone())
        .with_context(|| format!("registering {}", asset.asset_id))?;
    println!("Registered {} ({}, {})", asset.asset_id, asset.symbol, asset.asset_type);
    Ok(())
}

fn run_assets_deactivate(root: &Path, id: String) -> Result<()> {
    let store = open_store(root)?;
    let asset = store
        .deactivate(&AssetId::new(id), Utc::now())
        .context("deactivating asset")?;
    if let Some(at) = asset.deactivated_at {
        println!("Deactivated {} at {}", asset.asset_id, at.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

fn run_assets_list(root: &Path) -> Result<()> {
    let store = open_store(root)?;
    let assets = store.assets()?;
    if assets.is_empty() {
        println!("No assets registered in {}", root.display());
        return Ok(());
    }

    println!("{:<12} {:<10} {:<12} {:<12} {:<12}", "Asset", "Symbol", "Type", "Created", "Deactivated");
    println!("{}", "-".repeat(62));
    for a in &assets {
        println!(
            "{:<12} {:<10} {:<12} {:<12} {:<12}",
            a.asset_id.as_str(),
            a.symbol,
            a.asset_type.as_str(),
            a.created_at.format("%Y-%m-%d").to_string(),
            a.deactivated_at
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

fn run_tasks_status(root: &Path, failed_only: bool) -> Result<()> {
    let ledger = TaskLedger::in_dir(root).context("loading task ledger")?;
    if ledger.is_empty() {
        println!("Task ledger is empty: {}", root.display());
        return Ok(());
    }

    println!("Tasks: {}", ledger.len());
    for status in [
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Pending,
        TaskStatus::InFlight,
    ] {
        println!("  {:<10} {}", status.as_str(), ledger.count(status));
    }
    let unacked = ledger.unacknowledged_failures().len();
    if unacked > 0 {
        println!("Unacknowledged failures: {unacked} (see `tasks ack`)");
    }

    let rows: Vec<_> = ledger
        .tasks()
        .filter(|t| !failed_only || t.status == TaskStatus::Failed)
        .collect();
    if rows.is_empty() {
        return Ok(());
    }
    println!();
    println!(
        "{:<10} {:<12} {:<12} {:<10} {:>8} {:<5} Last error",
        "Asset", "Day", "Source", "Status", "Attempts", "Ack"
    );
    println!("{}", "-".repeat(72));
    for t in rows {
        println!(
            "{:<10} {:<12} {:<12} {:<10} {:>8} {:<5} {}",
            t.asset_id.as_str(),
            t.day.to_string(),
            t.source.as_str(),
            t.status.as_str(),
            t.attempt_count,
            if t.acknowledged { "yes" } else { "" },
            t.last_error.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

fn run_tasks_ack(root: &Path, asset: String, day: &str, source: String) -> Result<()> {
    let mut ledger = TaskLedger::in_dir(root).context("loading task ledger")?;
    let key = TaskKey::new(AssetId::new(asset), parse_day(day)?, SourceId::new(source));
    ledger
        .acknowledge(&key)
        .with_context(|| format!("acknowledging {key}"))?;
    ledger.save().context("saving task ledger")?;
    println!("Acknowledged {key}");
    Ok(())
}

fn run_store_status(root: &Path) -> Result<()> {
    if !root.exists() {
        println!("Store directory does not exist: {}", root.display());
        return Ok(());
    }
    let status = ParquetStore::status(root)
        .with_context(|| format!("reading store status {}", root.display()))?;

    println!("Store: {}", status.root.display());
    println!("Assets table: {}", if status.has_assets { "present" } else { "absent" });
    println!("Price partitions: {}", status.price_partitions);
    println!("Raw partitions: {}", status.raw_partitions);
    if status.outdated.is_empty() {
        println!("Schema: up to date");
    } else {
        println!("Schema: migration required");
        for (table, found, current) in &status.outdated {
            println!("  {table}: v{found} -> v{current}");
        }
    }
    Ok(())
}

fn run_store_migrate(root: &Path) -> Result<()> {
    let outcomes = ParquetStore::migrate(root)
        .with_context(|| format!("migrating store {}", root.display()))?;
    if outcomes.is_empty() {
        println!("Store is up to date.");
        return Ok(());
    }
    for o in &outcomes {
        println!(
            "Migrated {}: v{} -> v{} ({} file(s) rewritten)",
            o.table, o.from, o.to, o.files_rewritten
        );
    }
    Ok(())
}

fn run_review_list(log: &Path) -> Result<()> {
    let flags = JsonlReviewLog::new(log)
        .read_all()
        .with_context(|| format!("reading review log {}", log.display()))?;
    if flags.is_empty() {
        println!("No discrepancies logged in {}", log.display());
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:<6} {:<12} {:>12} {:<12} {:>12} {:>8}",
        "Asset", "Day", "Field", "Primary", "Value", "Other", "Value", "Diff"
    );
    println!("{}", "-".repeat(92));
    for f in &flags {
        println!(
            "{:<10} {:<12} {:<6} {:<12} {:>12.4} {:<12} {:>12.4} {:>7.2}%",
            f.asset_id.as_str(),
            f.day.to_string(),
            format!("{:?}", f.field).to_lowercase(),
            f.primary_source.as_str(),
            f.primary_value,
            f.other_source.as_str(),
            f.other_value,
            f.relative_diff * 100.0,
        );
    }
    Ok(())
}
