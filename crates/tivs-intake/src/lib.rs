//! Harvesting-worker boundary: the batch file format and the sources that
//! hand batches to the ingestion pipeline.
//!
//! A worker scrapes a portal however it likes and produces [`HarvestBatch`]es
//! of raw field maps. The store never sees anything but those maps.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tivs_core::RawRecord;
use tracing::warn;

pub const CRATE_NAME: &str = "tivs-intake";

/// Directory (inside a portal's batch directory) that acknowledged files move to.
pub const PROCESSED_DIR: &str = "processed";

/// Directory that unreadable or foreign-portal batch files are moved to.
pub const REJECTED_DIR: &str = "rejected";

fn default_scope() -> String {
    "all".to_string()
}

/// One harvesting pass worth of raw records for a single portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestBatch {
    /// Portal slug.
    pub portal: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    pub harvested_at: DateTime<Utc>,
    /// Listing size the worker saw; defaults to the number of records.
    #[serde(default)]
    pub expected: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
    pub records: Vec<RawRecord>,
}

impl HarvestBatch {
    pub fn new(portal: impl Into<String>, harvested_at: DateTime<Utc>, records: Vec<RawRecord>) -> Self {
        Self {
            portal: portal.into(),
            scope: default_scope(),
            harvested_at,
            expected: None,
            notes: None,
            records,
        }
    }

    pub fn expected_count(&self) -> u64 {
        self.expected.unwrap_or(self.records.len() as u64)
    }
}

/// A batch waiting to be ingested, with the handle used to acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    pub id: String,
    pub batch: HarvestBatch,
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("unknown batch {0}")]
    UnknownBatch(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait BatchSource: Send + Sync {
    fn portal_slug(&self) -> &str;

    /// Batches not yet acknowledged, oldest first.
    async fn pending(&self) -> Result<Vec<PendingBatch>, IntakeError>;

    /// Mark a batch as ingested so it is not offered again.
    async fn acknowledge(&self, id: &str) -> Result<(), IntakeError>;
}

pub fn load_batch_file(path: impl AsRef<Path>) -> Result<HarvestBatch> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Write `batch` as pretty JSON via a temp file and rename.
pub fn write_batch_file(path: impl AsRef<Path>, batch: &HarvestBatch) -> Result<()> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "batch.json".to_string());
    let temp_path = parent.join(format!(".{file_name}.tmp"));
    let body = serde_json::to_vec_pretty(batch).context("serializing batch")?;
    fs::write(&temp_path, body).with_context(|| format!("writing {}", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Lowercase, ASCII alphanumerics and single dashes.
pub fn normalize_slug(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Batch files under `<root>/<portal>/*.json`; acknowledged files move to
/// `<root>/<portal>/processed/`, files that cannot be served move to
/// `<root>/<portal>/rejected/`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    portal: String,
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl AsRef<Path>, portal: &str) -> Self {
        let portal = normalize_slug(portal);
        Self {
            dir: root.as_ref().join(&portal),
            portal,
        }
    }

    /// One source per portal subdirectory of `root`, sorted by slug.
    pub fn discover(root: impl AsRef<Path>) -> Result<Vec<Self>> {
        let root = root.as_ref();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut sources = Vec::new();
        for entry in fs::read_dir(root).with_context(|| format!("listing {}", root.display()))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                sources.push(Self::new(root, name));
            }
        }
        sources.sort_by(|a, b| a.portal.cmp(&b.portal));
        Ok(sources)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn batch_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("listing {}", self.dir.display()))? {
            let path = entry?.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if path.is_file() && is_json && !hidden {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Move a batch file out of the way so later batches keep flowing.
    fn reject(&self, path: &Path, reason: &str) -> Result<()> {
        warn!(portal = %self.portal, path = %path.display(), reason, "rejecting batch file");
        let rejected = self.dir.join(REJECTED_DIR);
        fs::create_dir_all(&rejected).with_context(|| format!("creating {}", rejected.display()))?;
        let Some(name) = path.file_name() else {
            return Ok(());
        };
        let to = rejected.join(name);
        fs::rename(path, &to).with_context(|| format!("moving {} to {}", path.display(), to.display()))
    }
}

#[async_trait]
impl BatchSource for DirectorySource {
    fn portal_slug(&self) -> &str {
        &self.portal
    }

    async fn pending(&self) -> Result<Vec<PendingBatch>, IntakeError> {
        let mut pending = Vec::new();
        for path in self.batch_files()? {
            let batch = match load_batch_file(&path) {
                Ok(batch) => batch,
                Err(err) => {
                    self.reject(&path, &format!("{err:#}"))?;
                    continue;
                }
            };
            if normalize_slug(&batch.portal) != self.portal {
                self.reject(&path, &format!("batch is for portal `{}`", batch.portal))?;
                continue;
            }
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            pending.push(PendingBatch { id, batch });
        }
        Ok(pending)
    }

    async fn acknowledge(&self, id: &str) -> Result<(), IntakeError> {
        let from = self.dir.join(id);
        if id.contains(['/', '\\']) || !from.is_file() {
            return Err(IntakeError::UnknownBatch(id.to_string()));
        }
        let processed = self.dir.join(PROCESSED_DIR);
        fs::create_dir_all(&processed).with_context(|| format!("creating {}", processed.display()))?;
        let to = processed.join(id);
        fs::rename(&from, &to)
            .with_context(|| format!("moving {} to {}", from.display(), to.display()))?;
        Ok(())
    }
}

/// In-memory source, handy for embedding a worker in-process.
#[derive(Debug)]
pub struct MemorySource {
    portal: String,
    batches: Mutex<Vec<PendingBatch>>,
    next_id: AtomicU64,
}

impl MemorySource {
    pub fn new(portal: &str) -> Self {
        Self {
            portal: normalize_slug(portal),
            batches: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn push(&self, batch: HarvestBatch) {
        let id = format!("memory-{:04}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PendingBatch { id, batch });
    }

    pub fn remaining(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl BatchSource for MemorySource {
    fn portal_slug(&self) -> &str {
        &self.portal
    }

    async fn pending(&self) -> Result<Vec<PendingBatch>, IntakeError> {
        Ok(self
            .batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    async fn acknowledge(&self, id: &str) -> Result<(), IntakeError> {
        let mut batches = self.batches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = batches.len();
        batches.retain(|pending| pending.id != id);
        if batches.len() == before {
            return Err(IntakeError::UnknownBatch(id.to_string()));
        }
        Ok(())
    }
}
