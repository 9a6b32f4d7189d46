//! Durable state: tickets, runs, and per-repository locks.
//!
//! The models here map 1:1 onto rows in the SQLite state database
//! (`db::StateDb`). Tickets are never deleted — their history is what
//! makes re-invocation idempotent.

pub mod db;

pub use db::{StateDb, StateHandle};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a ticket as tracked by prforge.
///
/// `RUNNING`/`QUEUED` are the only non-terminal states; at most one run
/// may hold a ticket in them at a time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Discovered,
    Queued,
    Running,
    PrOpened,
    Done,
    Failed,
    NeedsHuman,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "DISCOVERED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::PrOpened => "PR_OPENED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::NeedsHuman => "NEEDS_HUMAN",
        }
    }

    /// A ticket in one of these states has an attempt in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCOVERED" => Ok(Self::Discovered),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "PR_OPENED" => Ok(Self::PrOpened),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            "NEEDS_HUMAN" => Ok(Self::NeedsHuman),
            _ => Err(format!("Invalid ticket status: {}", s)),
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal (or in-flight) status of a single run attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    PrOpened,
    Failed,
    NeedsHuman,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::PrOpened => "PR_OPENED",
            Self::Failed => "FAILED",
            Self::NeedsHuman => "NEEDS_HUMAN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "PR_OPENED" => Ok(Self::PrOpened),
            "FAILED" => Ok(Self::Failed),
            "NEEDS_HUMAN" => Ok(Self::NeedsHuman),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl From<RunStatus> for TicketStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => TicketStatus::Running,
            RunStatus::PrOpened => TicketStatus::PrOpened,
            RunStatus::Failed => TicketStatus::Failed,
            RunStatus::NeedsHuman => TicketStatus::NeedsHuman,
        }
    }
}

/// One row per work-item key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_key: String,
    pub status: TicketStatus,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub last_run_id: Option<String>,
    pub updated_at: Option<String>,
    pub last_error: Option<String>,
}

/// One row per execution attempt for a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub ticket_key: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub agent_exit_code: Option<i32>,
    pub artifacts_dir: Option<String>,
    pub summary_json: Option<String>,
}

/// Holder of a repository's mutual-exclusion lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoLock {
    pub repo: String,
    pub run_id: String,
    pub locked_at: String,
}

/// Partial ticket update applied by `StateDb::upsert_ticket`.
///
/// `None` fields are left untouched; `Some` fields overwrite, except that
/// a non-forced upsert never clears an existing `pr_url` and never
/// downgrades a `DONE` ticket.
#[derive(Debug, Clone, Default)]
pub struct TicketPatch {
    pub status: Option<TicketStatus>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub last_run_id: Option<String>,
    pub last_error: Option<Option<String>>,
}

/// A previously achieved outcome, returned without repeating side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorOutcome {
    pub ticket_key: String,
    pub status: TicketStatus,
    pub pr_url: String,
    pub branch: Option<String>,
}

/// Fields written exactly once when a run reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub agent_exit_code: Option<i32>,
    pub summary_json: Option<String>,
}

/// Generate a unique, time-sortable run identifier.
pub fn new_run_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    let tail = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &tail[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_status_round_trips_through_str() {
        for status in [
            TicketStatus::Discovered,
            TicketStatus::Queued,
            TicketStatus::Running,
            TicketStatus::PrOpened,
            TicketStatus::Done,
            TicketStatus::Failed,
            TicketStatus::NeedsHuman,
        ] {
            assert_eq!(status.as_str().parse::<TicketStatus>().unwrap(), status);
        }
    }

    #[test]
    fn only_queued_and_running_are_in_flight() {
        assert!(TicketStatus::Running.is_in_flight());
        assert!(TicketStatus::Queued.is_in_flight());
        assert!(!TicketStatus::PrOpened.is_in_flight());
        assert!(!TicketStatus::NeedsHuman.is_in_flight());
    }

    #[test]
    fn run_status_terminal_classification() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::PrOpened.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::NeedsHuman.is_terminal());
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!("HALF_DONE".parse::<TicketStatus>().is_err());
        assert!("half_done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn run_ids_sort_by_creation_time() {
        let a = new_run_id();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = new_run_id();
        assert!(a < b, "expected {} < {}", a, b);
    }
}
