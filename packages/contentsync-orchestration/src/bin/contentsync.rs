//! Contentsync CLI
//!
//! # Usage
//!
//! ```bash
//! # Full pass from a JSON array of job items, then reconcile
//! contentsync --config sync.yaml import items.json --source cms
//!
//! # Re-index a few objects without reconciling
//! contentsync --config sync.yaml import hotfix.json --source cms --standalone
//!
//! # Re-run an incomplete reconciliation of the latest pass
//! # (the transaction id is printed by `import` and named in its error)
//! contentsync --config sync.yaml reconcile --source cms --transaction <tx>
//!
//! # Inspect the ledger
//! contentsync --config sync.yaml ledger --source cms
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use contentsync_orchestration::telemetry::init_tracing;
use contentsync_orchestration::{ContentSyncEngine, JobItem, SyncConfig};
use contentsync_storage::{
    CachedLedger, InMemoryLedger, InMemoryStatusLog, IndexingLedger, SqliteLedger,
    SqliteStatusLog, StatusLogSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "contentsync")]
#[command(about = "Incremental content synchronization for search indexes", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Forward to an in-process recording engine instead of the configured one
    #[arg(long, global = true)]
    dry_run: bool,

    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a JSON array of job items as one session
    Import {
        file: PathBuf,

        #[arg(short, long)]
        source: String,

        /// Do not reconcile afterwards
        #[arg(long)]
        standalone: bool,
    },

    /// Remove entries the source's latest drained pass did not confirm
    Reconcile {
        #[arg(short, long)]
        source: String,

        #[arg(short, long)]
        transaction: String,
    },

    /// Print the ledger entries of a source
    Ledger {
        #[arg(short, long)]
        source: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let mut config = SyncConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            config
        }
    };
    if cli.dry_run {
        config.engine.engine_type = "memory".to_string();
    }
    Ok(config)
}

fn open_storage(
    config: &SyncConfig,
) -> anyhow::Result<(Arc<dyn IndexingLedger>, Arc<dyn StatusLogSink>)> {
    let ledger: Arc<dyn IndexingLedger>;
    let sink: Arc<dyn StatusLogSink>;
    match &config.ledger.path {
        Some(path) => {
            ledger = Arc::new(SqliteLedger::open(path)?);
            sink = Arc::new(SqliteStatusLog::open(path)?);
        }
        None => {
            warn!("No ledger path configured, using an in-memory ledger");
            ledger = Arc::new(InMemoryLedger::new());
            sink = Arc::new(InMemoryStatusLog::new());
        }
    }

    let cached = CachedLedger::new(ledger, config.ledger.cache_capacity);
    Ok((Arc::new(cached), sink))
}

async fn import(
    engine: &ContentSyncEngine,
    file: PathBuf,
    source: &str,
    standalone: bool,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let items: Vec<JobItem> =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
    info!(items = items.len(), source = %source, standalone, "Importing");

    engine.start().await;

    if standalone {
        let receipt = engine.reindex(source, items).await?;
        println!("{}", serde_json::to_string_pretty(&receipt)?);
        return Ok(());
    }

    let session = engine.begin_session(source, false).await?;
    // Needed to re-run an incomplete reconciliation
    println!("{}", serde_json::to_string_pretty(&session)?);

    let receipt = match engine.send(&session, items).await {
        Ok(receipt) => receipt,
        Err(e) => {
            engine.abandon_session(&session).await;
            return Err(e.into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&receipt)?);

    let report = engine
        .finish_session(&session)
        .await
        .with_context(|| format!("finishing transaction {}", session.transaction_id))?;
    if let Some(report) = report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = load_config(&cli)?;
    let (ledger, sink) = open_storage(&config)?;
    let engine = ContentSyncEngine::builder(config)
        .ledger(ledger)
        .status_sink(sink)
        .build()?;

    let result = match cli.command {
        Commands::Import {
            file,
            source,
            standalone,
        } => import(&engine, file, &source, standalone).await,
        Commands::Reconcile {
            source,
            transaction,
        } => {
            let report = engine.reconcile(&source, &transaction).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_complete() {
                bail!(
                    "reconciliation incomplete: {} of {} stale entries left",
                    report.failed,
                    report.examined
                );
            }
            Ok(())
        }
        Commands::Ledger { source } => {
            for entry in engine.ledger().list_by_source(&source).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(())
        }
    };

    engine.shutdown().await;
    if engine.status_failures() > 0 {
        warn!(lost = engine.status_failures(), "Some status records could not be written");
    }
    result
}
