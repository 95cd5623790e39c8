//! Lifecycle status policy.
//!
//! `compute_status` is pure: it sees the stored status, the merged lifecycle
//! fields and the clock, and never touches storage.

use chrono::{DateTime, Duration, Utc};

use crate::TenderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPolicy {
    /// How long a tender stays in the closed family before it is archived.
    pub archive_grace: Duration,
    /// Whether an archived tender re-observed as open returns to `open`.
    pub reopen_archived: bool,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            archive_grace: Duration::days(30),
            reopen_archived: true,
        }
    }
}

/// Lifecycle inputs taken from the merged canonical fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusInputs {
    pub closing_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub signal: Option<TenderStatus>,
}

/// What this observation says on its own, or `None` when it carries no
/// lifecycle evidence (no closing date, no explicit signal).
fn observed_status(inputs: &StatusInputs, now: DateTime<Utc>) -> Option<TenderStatus> {
    let closing_passed = inputs.closing_at.map(|closing| closing <= now);
    match inputs.signal {
        Some(TenderStatus::Open) if closing_passed == Some(true) => Some(TenderStatus::Closed),
        Some(signal) => Some(signal),
        None => closing_passed.map(|passed| {
            if passed {
                TenderStatus::Closed
            } else {
                TenderStatus::Open
            }
        }),
    }
}

pub fn compute_status(
    current: Option<TenderStatus>,
    inputs: &StatusInputs,
    now: DateTime<Utc>,
    policy: &StatusPolicy,
) -> TenderStatus {
    let observed = observed_status(inputs, now);

    let Some(current) = current else {
        // First sighting: open unless already closed; never straight to archive.
        return match observed {
            None | Some(TenderStatus::Open) => TenderStatus::Open,
            Some(TenderStatus::Archived) => TenderStatus::Closed,
            Some(other) => other,
        };
    };

    let next = match (current, observed) {
        (_, None) => current,
        (TenderStatus::Archived, Some(TenderStatus::Open)) => {
            if policy.reopen_archived {
                TenderStatus::Open
            } else {
                TenderStatus::Archived
            }
        }
        (TenderStatus::Archived, Some(_)) => TenderStatus::Archived,
        (_, Some(TenderStatus::Open)) => TenderStatus::Open,
        (TenderStatus::Cancelled, Some(TenderStatus::Closed)) => TenderStatus::Cancelled,
        (_, Some(other)) => other,
    };

    if next.is_closed_family() && current.is_closed_family() {
        let closed_since = inputs.closed_at.or(inputs.closing_at);
        if closed_since.is_some_and(|since| now - since >= policy.archive_grace) {
            return TenderStatus::Archived;
        }
    }
    next
}
