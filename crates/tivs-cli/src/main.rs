use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tivs_core::BackupTier;
use tivs_intake::load_batch_file;
use tivs_storage::{store_now, AbortSignal, Partition, TenderStore};
use tivs_sync::{HealthProbe, IngestPipeline, PortalRegistry, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tivs")]
#[command(about = "Tender ingestion and versioning store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scope {
    All,
    Live,
    Archive,
}

impl From<Scope> for Partition {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::All => Partition::All,
            Scope::Live => Partition::Live,
            Scope::Archive => Partition::Archive,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every pending batch under the batch directory.
    Sync,
    /// Create the database if needed and apply migrations.
    Migrate,
    /// Register or refresh portals from the registry file.
    LoadPortals {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Ingest one batch file as a new run.
    Ingest { file: PathBuf },
    Search {
        text: String,
        #[arg(long, value_enum, default_value = "all")]
        scope: Scope,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Take the backups due today (or one tier) and prune old copies.
    Backup {
        #[arg(long)]
        tier: Option<BackupTier>,
    },
    Prune,
    /// Archive closed tenders past their grace period.
    Archive,
    /// Probe every active portal and record its health.
    Health,
    /// Audit derived rows against the canonical store.
    Verify,
    /// Serve the JSON API (and the maintenance scheduler when enabled).
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

/// Abort signal tripped by Ctrl-C, so committed records stand and the run
/// is finalized instead of left running.
fn abort_on_ctrl_c() -> AbortSignal {
    let abort = AbortSignal::new();
    let trip = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the record in flight");
            trip.abort();
        }
    });
    abort
}

async fn serve(config: &SyncConfig, store: TenderStore) -> Result<()> {
    let scheduler = tivs_sync::maybe_build_scheduler(config, store.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
    }
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    let state = tivs_web::AppState::new(store).with_reports_dir(&config.reports_dir);
    tivs_web::serve(listener, state).await
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = config.open_store().await?;
            let summary = tivs_sync::run_sync_once(&config, &store, &abort_on_ctrl_c()).await?;
            println!(
                "sync complete: sources={} runs={} failed_sources={} archived_expired={} reports={}",
                summary.sources,
                summary.runs.len(),
                summary.failed_sources.len(),
                summary.archived_expired,
                config.reports_dir.display()
            );
            if !summary.failed_sources.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let store = config.open_store().await?;
            println!("database ready: {}", store.database_path().display());
        }
        Commands::LoadPortals { file } => {
            let store = config.open_store().await?;
            let path = file.unwrap_or_else(|| config.portals_file.clone());
            let registered = PortalRegistry::load(&path).await?.apply(&store).await?;
            for (slug, id) in registered {
                println!("{slug}\t{id}");
            }
        }
        Commands::Ingest { file } => {
            let store = config.open_store().await?;
            let batch = load_batch_file(&file)?;
            let batch_id = file.display().to_string();
            let report = IngestPipeline::new(store)
                .with_reports_dir(&config.reports_dir)
                .ingest(&batch, Some(batch_id.as_str()), &abort_on_ctrl_c())
                .await?;
            print_json(&report)?;
        }
        Commands::Search { text, scope, limit } => {
            let store = config.open_store().await?;
            for item in store.search(&text, scope.into(), limit).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    item.id,
                    item.tender_status,
                    item.portal_tender_uid,
                    item.fields.title.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Backup { tier } => {
            let store = config.open_store().await?;
            match tier {
                Some(tier) => {
                    let record = store.create_backup(&config.backup_dir, tier, store_now()).await?;
                    print_json(&record)?;
                }
                None => {
                    let summary =
                        tivs_sync::run_backup_pass(&store, &config.backup_dir, &config.retention, store_now()).await;
                    print_json(&summary)?;
                    if !summary.failed.is_empty() {
                        return Ok(ExitCode::FAILURE);
                    }
                }
            }
        }
        Commands::Prune => {
            let store = config.open_store().await?;
            let pruned = store
                .prune_backups(&config.backup_dir, &config.retention, store_now())
                .await?;
            println!("pruned {} backup copies", pruned.len());
        }
        Commands::Archive => {
            let store = config.open_store().await?;
            let archived = store.archive_expired(store_now()).await?;
            println!("archived {archived} tenders");
        }
        Commands::Health => {
            let store = config.open_store().await?;
            let probe = HealthProbe::from_config(&config)?;
            for (slug, status) in probe.check_portals(&store).await? {
                println!("{slug}\t{status}");
            }
        }
        Commands::Verify => {
            let store = config.open_store().await?;
            let report = store.verify_integrity().await?;
            print_json(&report)?;
            if !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Serve => {
            let store = config.open_store().await?;
            info!(addr = %config.bind_addr, "starting server");
            serve(&config, store).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
