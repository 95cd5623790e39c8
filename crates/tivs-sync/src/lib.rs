//! Sync orchestration: configuration, batch ingestion, portal health and
//! scheduled maintenance around a [`TenderStore`].

use std::sync::Arc;

use anyhow::Result;
use tivs_intake::{BatchSource, DirectorySource};
use tivs_storage::{AbortSignal, TenderStore};
use tracing::{info, warn};

pub mod config;
pub mod health;
pub mod pipeline;
pub mod report;
pub mod schedule;

pub use config::{PortalConfig, PortalRegistry, SyncConfig};
pub use health::HealthProbe;
pub use pipeline::{IngestPipeline, SyncRunSummary};
pub use report::RunReport;
pub use schedule::{maybe_build_scheduler, run_backup_pass, BackupPassSummary};

pub const CRATE_NAME: &str = "tivs-sync";

/// Register portals from the registry file when it exists.
pub async fn load_portals(config: &SyncConfig, store: &TenderStore) -> Result<usize> {
    if !tokio::fs::try_exists(&config.portals_file).await.unwrap_or(false) {
        warn!(path = %config.portals_file.display(), "portal registry not found, keeping stored portals");
        return Ok(0);
    }
    let registry = PortalRegistry::load(&config.portals_file).await?;
    Ok(registry.apply(store).await?.len())
}

pub fn directory_sources(config: &SyncConfig) -> Result<Vec<Arc<dyn BatchSource>>> {
    Ok(DirectorySource::discover(&config.batch_dir)?
        .into_iter()
        .map(|source| Arc::new(source) as Arc<dyn BatchSource>)
        .collect())
}

/// One full pass over the batch directory with the given store.
pub async fn run_sync_once(config: &SyncConfig, store: &TenderStore, abort: &AbortSignal) -> Result<SyncRunSummary> {
    load_portals(config, store).await?;
    let sources = directory_sources(config)?;
    info!(sources = sources.len(), dir = %config.batch_dir.display(), "starting sync pass");
    IngestPipeline::new(store.clone())
        .with_reports_dir(&config.reports_dir)
        .sync_all(sources, abort)
        .await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let store = config.open_store().await?;
    run_sync_once(&config, &store, &AbortSignal::new()).await
}
