//! Environment configuration and the portal registry file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tivs_core::{PortalId, StatusPolicy};
use tivs_intake::normalize_slug;
use tivs_storage::{BackoffPolicy, RetentionPolicy, StoreOptions, TenderStore};
use tracing::info;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub backup_dir: PathBuf,
    pub batch_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub portals_file: PathBuf,
    pub bind_addr: String,
    pub scheduler_enabled: bool,
    pub backup_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retention: RetentionPolicy,
    pub status_policy: StatusPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| PathBuf::from(lookup(key).unwrap_or_else(|| default.to_string()));
        let number = |key: &str, default: u32| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };
        let defaults = RetentionPolicy::default();

        Self {
            database_path: path("TIVS_DATABASE_PATH", "./data/tenders.db"),
            backup_dir: path("TIVS_BACKUP_DIR", "./backups"),
            batch_dir: path("TIVS_BATCH_DIR", "./batches"),
            reports_dir: path("TIVS_REPORTS_DIR", "./reports"),
            portals_file: path("TIVS_PORTALS_FILE", "./portals.yaml"),
            bind_addr: lookup("TIVS_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            scheduler_enabled: flag("TIVS_SCHEDULER_ENABLED", false),
            backup_cron: lookup("TIVS_BACKUP_CRON").unwrap_or_else(|| "0 30 2 * * *".to_string()),
            user_agent: lookup("TIVS_USER_AGENT").unwrap_or_else(|| "tivs-bot/0.1".to_string()),
            http_timeout_secs: lookup("TIVS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            retention: RetentionPolicy {
                daily_days: number("TIVS_RETAIN_DAILY_DAYS", defaults.daily_days),
                weekly_weeks: number("TIVS_RETAIN_WEEKLY_WEEKS", defaults.weekly_weeks),
                monthly_months: number("TIVS_RETAIN_MONTHLY_MONTHS", defaults.monthly_months),
                yearly_years: number("TIVS_RETAIN_YEARLY_YEARS", defaults.yearly_years),
            },
            status_policy: StatusPolicy {
                archive_grace: chrono::Duration::days(i64::from(number("TIVS_ARCHIVE_GRACE_DAYS", 30))),
                reopen_archived: flag("TIVS_REOPEN_ARCHIVED", true),
            },
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::new(&self.database_path).with_status_policy(self.status_policy)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Backoff for portal probes: a few spaced attempts rather than the
    /// store's tight lock-contention loop.
    pub fn probe_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }

    pub async fn open_store(&self) -> Result<TenderStore> {
        TenderStore::open(self.store_options())
            .await
            .with_context(|| format!("opening store at {}", self.database_path.display()))
    }
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalRegistry {
    pub portals: Vec<PortalConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub slug: String,
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl PortalRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing portal registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for portal in &self.portals {
            if portal.slug.is_empty() || normalize_slug(&portal.slug) != portal.slug {
                bail!("portal slug `{}` must be lowercase letters, digits and dashes", portal.slug);
            }
            if !seen.insert(portal.slug.as_str()) {
                bail!("portal slug `{}` is listed twice", portal.slug);
            }
        }
        Ok(())
    }

    /// Register every listed portal, refreshing name/URL/active on existing slugs.
    pub async fn apply(&self, store: &TenderStore) -> Result<Vec<(String, PortalId)>> {
        let mut registered = Vec::with_capacity(self.portals.len());
        for portal in &self.portals {
            let id = store
                .ensure_portal(&portal.slug, &portal.name, &portal.base_url, portal.active)
                .await
                .with_context(|| format!("registering portal `{}`", portal.slug))?;
            registered.push((portal.slug.clone(), id));
        }
        info!(portals = registered.len(), "portal registry applied");
        Ok(registered)
    }
}
