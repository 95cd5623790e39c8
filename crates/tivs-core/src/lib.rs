//! Core domain model for the tender ingestion & versioning store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod parse;
pub mod record;
pub mod status;

pub use record::{RawRecord, RecordError, TenderRecord};
pub use status::{compute_status, StatusInputs, StatusPolicy};

pub const CRATE_NAME: &str = "tivs-core";

pub type PortalId = i64;
pub type RunId = i64;
pub type TenderId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal $(| $alias:literal)*),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text $(| $alias)* => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Lifecycle state of a canonical tender.
    TenderStatus, "tender status", {
        Open => "open" | "active" | "live",
        Closed => "closed" | "expired",
        Cancelled => "cancelled" | "canceled" | "withdrawn",
        Archived => "archived",
    }
);

impl TenderStatus {
    /// The only status that places a tender in the live partition.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Closed and cancelled tenders carry `closed_at` and are eligible for archival.
    pub fn is_closed_family(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

string_enum!(
    RunStatus, "run status", {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Partial => "partial",
    }
);

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

string_enum!(
    /// Terminal states a run may be finalized into.
    RunOutcome, "run outcome", {
        Completed => "completed",
        Failed => "failed",
        Partial => "partial",
    }
);

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Failed => RunStatus::Failed,
            RunOutcome::Partial => RunStatus::Partial,
        }
    }
}

impl RunOutcome {
    /// Classify a finished (or aborted) pass from its counters.
    ///
    /// `failed` only when nothing usable was extracted; `partial` when fewer
    /// records landed than the harvester expected or the pass was aborted.
    pub fn suggest(counts: &RunCounts, aborted: bool) -> Self {
        if counts.extracted == 0 && (aborted || counts.errors > 0 || counts.expected > 0) {
            return Self::Failed;
        }
        if aborted || counts.extracted < counts.expected {
            return Self::Partial;
        }
        Self::Completed
    }
}

string_enum!(
    HealthStatus, "health status", {
        Unknown => "unknown",
        Up => "up" | "healthy",
        Degraded => "degraded",
        Down => "down" | "unreachable",
    }
);

string_enum!(
    BackupTier, "backup tier", {
        Daily => "daily",
        Weekly => "weekly",
        Monthly => "monthly",
        Yearly => "yearly",
    }
);

impl BackupTier {
    pub const ALL: [BackupTier; 4] = [Self::Daily, Self::Weekly, Self::Monthly, Self::Yearly];
}

string_enum!(
    BackupOutcome, "backup outcome", {
        Success => "success",
        Failure => "failure",
        Pruned => "pruned",
    }
);

/// Monitored procurement portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portal {
    pub id: PortalId,
    pub slug: String,
    pub name: String,
    pub base_url: String,
    pub is_active: bool,
    pub health_status: HealthStatus,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

/// Record counters carried by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub expected: u64,
    pub extracted: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// One harvesting pass over a portal (or a scope within it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: RunId,
    pub portal_id: PortalId,
    pub scope: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub output_ref: Option<String>,
    pub notes: Option<String>,
}

/// Descriptive tender fields shared by canonical rows, snapshots and incoming records.
///
/// `None` means "not known" on canonical rows and "not present" on incoming
/// records; merging never overwrites with an absent value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenderFields {
    pub title: Option<String>,
    pub reference_number: Option<String>,
    pub department: Option<String>,
    pub organisation_chain: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub opening_at: Option<DateTime<Utc>>,
    pub closing_at: Option<DateTime<Utc>>,
    pub emd_text: Option<String>,
    pub emd_amount: Option<f64>,
    pub estimated_cost_text: Option<String>,
    pub estimated_cost: Option<f64>,
    pub tender_type: Option<String>,
    pub work_type: Option<String>,
    pub payment_type: Option<String>,
    pub location: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub pincode: Option<String>,
    pub detail_url: Option<String>,
}

fn overwrite<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    match incoming {
        Some(value) => {
            *slot = Some(value.clone());
            true
        }
        None => false,
    }
}

impl TenderFields {
    /// Overwrite every field present in `incoming`; absent fields keep their value.
    /// Returns the number of fields taken from `incoming`.
    pub fn merge_from(&mut self, incoming: &TenderFields) -> usize {
        [
            overwrite(&mut self.title, &incoming.title),
            overwrite(&mut self.reference_number, &incoming.reference_number),
            overwrite(&mut self.department, &incoming.department),
            overwrite(&mut self.organisation_chain, &incoming.organisation_chain),
            overwrite(&mut self.published_at, &incoming.published_at),
            overwrite(&mut self.opening_at, &incoming.opening_at),
            overwrite(&mut self.closing_at, &incoming.closing_at),
            overwrite(&mut self.emd_text, &incoming.emd_text),
            overwrite(&mut self.emd_amount, &incoming.emd_amount),
            overwrite(&mut self.estimated_cost_text, &incoming.estimated_cost_text),
            overwrite(&mut self.estimated_cost, &incoming.estimated_cost),
            overwrite(&mut self.tender_type, &incoming.tender_type),
            overwrite(&mut self.work_type, &incoming.work_type),
            overwrite(&mut self.payment_type, &incoming.payment_type),
            overwrite(&mut self.location, &incoming.location),
            overwrite(&mut self.city, &incoming.city),
            overwrite(&mut self.district, &incoming.district),
            overwrite(&mut self.state, &incoming.state),
            overwrite(&mut self.pincode, &incoming.pincode),
            overwrite(&mut self.detail_url, &incoming.detail_url),
        ]
        .into_iter()
        .filter(|taken| *taken)
        .count()
    }

    /// Normalized text stored in the search index for these fields.
    pub fn search_text(&self) -> String {
        let parts = [
            &self.title,
            &self.reference_number,
            &self.department,
            &self.organisation_chain,
            &self.tender_type,
            &self.work_type,
            &self.location,
            &self.city,
            &self.district,
            &self.state,
        ];
        normalize_search_text(
            &parts
                .iter()
                .filter_map(|p| p.as_deref())
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

/// Lowercase, strip punctuation and collapse whitespace.
pub fn normalize_search_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical current-truth row for one `(portal, portal_tender_uid)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderItem {
    pub id: TenderId,
    pub portal_id: PortalId,
    pub portal_tender_uid: String,
    pub fields: TenderFields,
    pub is_live: bool,
    pub tender_status: TenderStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub source_run_id: RunId,
}

/// Immutable copy of a tender as observed in one run, or as left by a
/// housekeeping status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderSnapshot {
    pub id: i64,
    pub tender_id: TenderId,
    /// `None` for housekeeping snapshots not caused by a run.
    pub run_id: Option<RunId>,
    pub captured_at: DateTime<Utc>,
    pub fields: TenderFields,
    pub tender_status: TenderStatus,
    pub is_live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub id: i64,
    pub tender_id: TenderId,
    pub old_status: Option<TenderStatus>,
    pub new_status: TenderStatus,
    pub changed_at: DateTime<Utc>,
    pub reason: Option<String>,
    /// `None` for housekeeping transitions not caused by a run.
    pub run_id: Option<RunId>,
}

/// Audit row for one backup attempt or pruned copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: i64,
    pub backup_date: DateTime<Utc>,
    pub source_path: String,
    pub destination_path: String,
    pub tier: BackupTier,
    pub outcome: BackupOutcome,
    pub detail: Option<String>,
}
