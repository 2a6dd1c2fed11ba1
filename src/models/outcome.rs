// src/models/outcome.rs

//! Results reported by scan and mirror runs.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{DestinationId, MirrorMode, ScanCursor};

/// Coarse run status printed for CI (`status=...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    NothingToDo,
    Completed,
    Partial,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NothingToDo => write!(f, "nothing-to-do"),
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

/// Why a scan stopped before the end of its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    BudgetExceeded,
    ApiUnavailable,
}

impl fmt::Display for PartialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded => write!(f, "wall-clock budget exceeded"),
            Self::ApiUnavailable => write!(f, "catalog API unavailable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanStatus {
    Completed,
    Partial { reason: PartialReason },
    NothingToDo,
}

impl ScanStatus {
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::Partial { .. } => RunStatus::Partial,
            Self::NothingToDo => RunStatus::NothingToDo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Retries exhausted on transient failures
    Unresolved,
    /// Catalog answered with an error that retrying will not fix
    Fetch,
    /// Record had neither a title nor a localized name
    NamelessRecord,
}

/// An identifier that was processed but not merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub id: u64,
    pub reason: RejectReason,
    pub message: String,
}

/// What a scan run accomplished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub status: ScanStatus,
    /// Ids that returned a record and were merged
    pub matched: Vec<u64>,
    /// Ids covered by an aggressive group match without a lookup
    pub grouped: Vec<u64>,
    pub rejected: Vec<Rejection>,
    /// Ids the catalog reported as not found
    pub empty: u64,
    /// Local ids of entries created by this run
    pub created: Vec<u32>,
    /// Local ids of existing entries this run changed
    pub updated: Vec<u32>,
    pub cursor: ScanCursor,
}

impl ScanResult {
    pub fn nothing_to_do(cursor: ScanCursor) -> Self {
        Self {
            status: ScanStatus::NothingToDo,
            matched: Vec::new(),
            grouped: Vec::new(),
            rejected: Vec::new(),
            empty: 0,
            created: Vec::new(),
            updated: Vec::new(),
            cursor,
        }
    }
}

/// Result of syncing one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub pushed: bool,
    pub changed_folders: BTreeSet<u32>,
    /// Files added, modified or removed
    pub changed_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationOutcome {
    Synced(SyncResult),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationReport {
    pub destination: DestinationId,
    pub mode: MirrorMode,
    pub outcome: DestinationOutcome,
}

/// Per-destination outcomes of a mirror run, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionReport {
    pub outcomes: Vec<DestinationReport>,
}

impl DistributionReport {
    pub fn failed(&self) -> impl Iterator<Item = &DestinationReport> {
        self.outcomes
            .iter()
            .filter(|r| matches!(r.outcome, DestinationOutcome::Failed { .. }))
    }

    pub fn pushed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|r| matches!(&r.outcome, DestinationOutcome::Synced(s) if s.pushed))
            .count()
    }

    pub fn status(&self) -> RunStatus {
        if self.failed().next().is_some() {
            RunStatus::Partial
        } else if self.pushed_count() == 0 {
            RunStatus::NothingToDo
        } else {
            RunStatus::Completed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(dest: &str, outcome: DestinationOutcome) -> DestinationReport {
        DestinationReport {
            destination: dest.into(),
            mode: MirrorMode::Partitioned,
            outcome,
        }
    }

    #[test]
    fn distribution_status() {
        let pushed = DestinationOutcome::Synced(SyncResult {
            pushed: true,
            ..Default::default()
        });
        let idle = DestinationOutcome::Synced(SyncResult::default());
        let failed = DestinationOutcome::Failed {
            error: "denied".into(),
        };

        let all_idle = DistributionReport {
            outcomes: vec![report("a", idle.clone())],
        };
        assert_eq!(all_idle.status(), RunStatus::NothingToDo);

        let ok = DistributionReport {
            outcomes: vec![report("a", pushed.clone()), report("b", idle)],
        };
        assert_eq!(ok.status(), RunStatus::Completed);

        let mixed = DistributionReport {
            outcomes: vec![report("x", failed), report("y", pushed)],
        };
        assert_eq!(mixed.status(), RunStatus::Partial);
        assert_eq!(mixed.failed().count(), 1);
    }

    #[test]
    fn status_strings() {
        assert_eq!(RunStatus::NothingToDo.to_string(), "nothing-to-do");
        assert_eq!(
            ScanStatus::Partial {
                reason: PartialReason::BudgetExceeded
            }
            .run_status(),
            RunStatus::Partial
        );
    }
}
