use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, warn};

use doha_harvest::artifacts::ArtifactStore;
use doha_harvest::browser::{self, SessionPolicy, SessionPool};
use doha_harvest::catalog::builder::CatalogBuilder;
use doha_harvest::catalog::{Catalog, Category};
use doha_harvest::config::Settings;
use doha_harvest::ledger::{Ledger, Status};
use doha_harvest::orchestrator::{self, RunOptions};
use doha_harvest::reprocess;
use doha_harvest::sink::DatasetSink;
use doha_harvest::db;

#[derive(Parser)]
#[command(name = "doha_harvest", about = "DOHA decision harvester: catalog, download, classify, export")]
struct Cli {
    /// Config file (default: ./harvest.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Root for catalog, checkpoints, artifacts and dataset
    #[arg(long, global = true, env = "DOHA_DATA_DIR")]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl listing pages into per-year catalog shards
    DiscoverLinks {
        /// Only this category (default: both)
        #[arg(short, long, value_enum)]
        category: Option<Category>,
        /// First year to sweep
        #[arg(long, requires = "to_year")]
        from_year: Option<i32>,
        /// Last year to sweep
        #[arg(long, requires = "from_year")]
        to_year: Option<i32>,
    },
    /// Fetch and parse every catalog entry not already done
    Download {
        #[arg(short, long, value_enum)]
        category: Option<Category>,
        /// Stop admitting new items after this many
        #[arg(short = 'n', long)]
        max_items: Option<usize>,
        #[arg(short, long)]
        workers: Option<usize>,
        /// Minimum seconds between fetches on one session
        #[arg(long)]
        rate_limit: Option<f64>,
        /// Re-fetch items the ledger already has
        #[arg(long)]
        force: bool,
        #[arg(long)]
        checkpoint_every: Option<usize>,
    },
    /// Fold all checkpoint shards into one and rebuild the record store
    MergeCheckpoints {
        /// Move superseded shards under checkpoints/archive/
        #[arg(long)]
        archive: bool,
    },
    /// Write the record store and Parquet shards from the ledger
    ExportDataset {
        /// Ceiling per Parquet shard, in MiB
        #[arg(long)]
        max_shard_mb: Option<u64>,
    },
    /// Re-parse stored artifacts without touching the network
    Reprocess {
        #[arg(short, long, value_enum)]
        category: Option<Category>,
    },
    /// Show catalog, ledger and dataset counts
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }
    ExitCode::from(code)
}

async fn execute(cli: Cli) -> Result<u8> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }

    match cli.command {
        Commands::DiscoverLinks {
            category,
            from_year,
            to_year,
        } => {
            let categories = category.map_or(Category::ALL.to_vec(), |c| vec![c]);
            let years = from_year.zip(to_year);
            let pool = session_pool(&settings)?;
            let mut session = pool.acquire().await.context("starting browser session")?;
            let report = {
                let mut builder = CatalogBuilder::new(
                    &mut session,
                    settings.catalog_dir(),
                    settings.catalog.clone(),
                );
                builder.discover_range(&categories, years, Utc::now()).await
            };
            pool.release(session).await;
            let report = report?;

            for (c, year, n) in &report.fetched {
                println!("  fetched {c} {year}: {n} links");
            }
            for (c, year, n) in &report.loaded {
                println!("  on disk {c} {year}: {n} links");
            }
            for (c, year) in &report.empty {
                println!("  empty   {c} {year}");
            }
            for e in &report.failed {
                println!("  FAILED  {e}");
            }
            println!(
                "Catalog: {} entries ({} sections fetched, {} on disk, {} empty, {} failed)",
                report.catalog.len(),
                report.fetched.len(),
                report.loaded.len(),
                report.empty.len(),
                report.failed.len(),
            );
            Ok(if report.failed.is_empty() { 0 } else { 2 })
        }
        Commands::Download {
            category,
            max_items,
            workers,
            rate_limit,
            force,
            checkpoint_every,
        } => {
            if let Some(w) = workers {
                settings.download.workers = w;
            }
            if let Some(k) = checkpoint_every {
                settings.download.checkpoint_every = k;
            }
            if let Some(secs) = rate_limit {
                settings.browser.min_interval_ms = (secs * 1000.0).round() as u64;
            }
            settings.validate()?;

            let catalog = load_catalog(&settings)?;
            if catalog.is_empty() {
                println!("Catalog is empty. Run 'discover-links' first.");
                return Ok(0);
            }
            let mut ledger = Ledger::open(settings.checkpoint_dir())?;
            let artifacts = ArtifactStore::new(settings.artifact_dir());
            let pool = Arc::new(session_pool(&settings)?);

            let opts = RunOptions {
                max_items,
                force,
                category,
                show_progress: true,
                ..RunOptions::from_settings(&settings.download)
            };
            let stop = Arc::clone(&opts.stop);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight items");
                    stop.store(true, Ordering::SeqCst);
                }
            });

            let summary = orchestrator::run(&catalog, &mut ledger, &artifacts, pool, opts).await?;
            println!(
                "Download: {} queued, {} skipped, {} succeeded, {} failed, {} checkpoints",
                summary.queued,
                summary.skipped,
                summary.succeeded,
                summary.failed_total(),
                summary.flushes,
            );
            for (kind, n) in &summary.failed {
                println!("  {kind}: {n}");
            }
            if summary.workers_lost > 0 {
                println!("  {} worker(s) lost; re-run to retry their items.", summary.workers_lost);
            }
            if summary.stopped {
                println!("Stopped early; re-run to continue.");
            }
            if summary.aborted {
                println!("Aborted: no item reached the ledger.");
            }
            Ok(summary.exit_code())
        }
        Commands::MergeCheckpoints { archive } => {
            let mut ledger = Ledger::open(settings.checkpoint_dir())?;
            let merged = ledger.consolidate()?;
            let sink = DatasetSink::new(settings.dataset_dir(), settings.export.clone());
            let store = sink.write_store(&ledger.state().exportable_cases())?;
            println!(
                "Merged {} shards: {} records, {} cases -> {}",
                merged.superseded.len(),
                merged.records,
                merged.cases,
                merged.shard.display(),
            );
            println!("Record store: {}", store.display());
            if archive {
                let target = ledger.archive(&merged.superseded, Utc::now())?;
                println!("Archived superseded shards to {}", target.display());
            }
            Ok(0)
        }
        Commands::ExportDataset { max_shard_mb } => {
            if let Some(mb) = max_shard_mb {
                settings.export.max_shard_bytes = mb * 1024 * 1024;
            }
            settings.validate()?;
            let ledger = Ledger::open(settings.checkpoint_dir())?;
            let cases = ledger.state().exportable_cases();
            if cases.is_empty() {
                println!("No parsed cases in the ledger. Run 'download' first.");
                return Ok(0);
            }
            let sink = DatasetSink::new(settings.dataset_dir(), settings.export.clone());
            let out = sink.write(&cases)?;
            println!("Exported {} cases", out.rows);
            println!("  store:   {}", out.store_path.display());
            for path in &out.columnar_paths {
                println!("  parquet: {}", path.display());
            }
            Ok(0)
        }
        Commands::Reprocess { category } => {
            let catalog = load_catalog(&settings)?;
            let artifacts = ArtifactStore::new(settings.artifact_dir());
            let mut ledger = Ledger::open(settings.checkpoint_dir())?;
            let summary =
                reprocess::reprocess(&catalog, &artifacts, &mut ledger, category, true)?;
            println!(
                "Reprocessed {} artifacts ({} parsed, {} failed, {} without artifact)",
                summary.parsed + summary.failed,
                summary.parsed,
                summary.failed,
                summary.missing_artifact,
            );
            Ok(if summary.failed > 0 { 2 } else { 0 })
        }
        Commands::Stats => {
            print_stats(&settings)?;
            Ok(0)
        }
    }
}

fn session_pool(settings: &Settings) -> Result<SessionPool> {
    let launcher = browser::launcher_for(&settings.browser)?;
    Ok(SessionPool::new(launcher, SessionPolicy::from(&settings.browser)))
}

/// Combined catalog file, or the union of shards when it is missing.
fn load_catalog(settings: &Settings) -> Result<Catalog> {
    let combined = settings.combined_catalog_path();
    if combined.exists() {
        return Ok(Catalog::load(&combined)?);
    }
    let dir = settings.catalog_dir();
    if !dir.exists() {
        return Ok(Catalog::default());
    }
    Ok(Catalog::from_shard_dir(&dir)?)
}

fn print_stats(settings: &Settings) -> Result<()> {
    let catalog = load_catalog(settings)?;
    println!("Catalog:   {}", catalog.len());
    let mut by_category: BTreeMap<Category, usize> = BTreeMap::new();
    for ((category, year), n) in catalog.counts() {
        *by_category.entry(category).or_default() += n;
        println!("  {:<8} {:>4}  {:>6}", category.as_str(), year, n);
    }
    for (category, n) in &by_category {
        println!("  {:<8} total {:>6}", category.as_str(), n);
    }

    let ledger = Ledger::open(settings.checkpoint_dir())?;
    let state = ledger.state();
    let succeeded = state.records().filter(|r| r.status == Status::Succeeded).count();
    let mut failures = BTreeMap::new();
    for r in state.records().filter(|r| r.status == Status::Failed) {
        if let Some(kind) = r.error_kind {
            *failures.entry(kind).or_insert(0usize) += 1;
        }
    }
    println!("Ledger:    {} records in {} shards", state.record_count(), ledger.shard_paths().len());
    println!("Succeeded: {}", succeeded);
    println!("Failed:    {}", failures.values().sum::<usize>());
    for (kind, n) in &failures {
        println!("  {:<12} {:>6}", kind.as_str(), n);
    }
    println!("Pending:   {}", catalog.len().saturating_sub(state.record_count()));

    let store = settings.dataset_dir().join(db::STORE_FILE);
    if store.exists() {
        print_store_stats(&store)?;
    }
    Ok(())
}

fn print_store_stats(path: &Path) -> Result<()> {
    let conn = db::connect(path)?;
    println!("Dataset:   {} cases", db::count_cases(&conn)?);
    for row in db::outcome_counts(&conn)? {
        println!("  {:<8} {:<10} {:>6}", row.category, row.outcome, row.count);
    }
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
