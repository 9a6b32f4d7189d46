//! Typed error hierarchy for the prforge orchestrator.
//!
//! Two top-level enums cover the two subsystems:
//! - `StateError` — state-store contract violations and storage failures
//! - `PipelineError` — everything that can stop a run, with its terminal
//!   classification (`FAILED` vs `NEEDS_HUMAN`) attached

use thiserror::Error;

use crate::contract::ContractError;
use crate::guardrails::Violation;
use crate::state::RunStatus;

/// Errors from the durable state store.
///
/// `AlreadyRunning` and `AlreadyFinished` are programming-contract
/// violations on the store API: always fatal to the calling operation,
/// never silently ignored.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("run {run_id} is still in flight for ticket {ticket_key}")]
    AlreadyRunning { ticket_key: String, run_id: String },

    #[error("run {run_id} already has a terminal status recorded")]
    AlreadyFinished { run_id: String },

    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("state database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("state database lock poisoned")]
    LockPoisoned,
}

/// Errors that terminate a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ticket {key} not found in the ticket source")]
    TicketNotFound { key: String },

    #[error("ticket {key} is missing a summary or description")]
    TicketIncomplete { key: String },

    #[error("repo mapping ambiguous or not allowed for {key}: {reason}")]
    MappingAmbiguous { key: String, reason: String },

    #[error("repository not found locally at {path}")]
    RepoMissing { path: std::path::PathBuf },

    #[error("worktree not clean in {repo}")]
    WorktreeDirty { repo: String, status: String },

    #[error("guardrail violation: {}", format_violations(.violations))]
    GuardrailViolation { violations: Vec<Violation> },

    #[error("agent contract invalid: {0}")]
    ContractInvalid(#[from] ContractError),

    #[error("could not determine a test command for {repo} and tests are required")]
    TestCommandUndetected { repo: String },

    #[error("agent declined to proceed ({kind}): {reason}")]
    AgentDeclined {
        kind: String,
        reason: String,
        /// True when the agent asked for a human, false when it reported
        /// outright failure.
        needs_human: bool,
    },

    #[error("tests still failing after {attempts} fix attempt(s)")]
    TestsFailing {
        attempts: u32,
        /// True when the failure looks like a tooling/environment problem
        /// (command missing or not runnable) rather than a logic gap.
        environment: bool,
    },

    #[error("agent timed out after {minutes} minute(s)")]
    AgentTimeout { minutes: u64 },

    #[error("command `{command}` timed out after {seconds}s")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("authentication failed against {service}: {message}")]
    Auth { service: String, message: String },

    #[error("{service} unavailable after {attempts} attempt(s): {message}")]
    Transient {
        service: String,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    /// Terminal run status this error classifies to.
    ///
    /// Conditions a human can resolve without another automated attempt
    /// map to `NEEDS_HUMAN`; defects and exhausted recovery budgets map
    /// to `FAILED`.
    pub fn terminal_status(&self) -> RunStatus {
        match self {
            Self::TicketIncomplete { .. }
            | Self::MappingAmbiguous { .. }
            | Self::WorktreeDirty { .. }
            | Self::TestCommandUndetected { .. }
            | Self::GuardrailViolation { .. } => RunStatus::NeedsHuman,
            Self::AgentDeclined { needs_human, .. } => {
                if *needs_human {
                    RunStatus::NeedsHuman
                } else {
                    RunStatus::Failed
                }
            }
            Self::TestsFailing { environment, .. } => {
                if *environment {
                    RunStatus::Failed
                } else {
                    RunStatus::NeedsHuman
                }
            }
            _ => RunStatus::Failed,
        }
    }

    /// Stable label for logs and session events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TicketNotFound { .. } => "ticket_not_found",
            Self::TicketIncomplete { .. } => "ticket_incomplete",
            Self::MappingAmbiguous { .. } => "mapping_ambiguous",
            Self::RepoMissing { .. } => "repo_missing",
            Self::WorktreeDirty { .. } => "worktree_dirty",
            Self::TestCommandUndetected { .. } => "test_command_undetected",
            Self::GuardrailViolation { .. } => "guardrail_violation",
            Self::AgentDeclined { .. } => "agent_declined",
            Self::ContractInvalid(_) => "contract_invalid",
            Self::TestsFailing { .. } => "tests_failing",
            Self::AgentTimeout { .. } => "agent_timeout",
            Self::CommandTimeout { .. } => "command_timeout",
            Self::Auth { .. } => "auth",
            Self::Transient { .. } => "transient",
            Self::State(_) => "state",
            Self::Other(_) => "other",
        }
    }

    /// Operator guidance attached to every terminal non-success result.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::TicketIncomplete { .. } => "fill in the ticket summary/description, then re-run",
            Self::MappingAmbiguous { .. } => {
                "add a repo mapping or allowlist entry for this ticket, then re-run"
            }
            Self::WorktreeDirty { .. } => "commit or stash local changes, then re-run",
            Self::TestCommandUndetected { .. } => {
                "configure guardrails.test_command for this repo, then re-run"
            }
            Self::AgentDeclined { .. } => "read the agent's blocking reason and act on it",
            Self::GuardrailViolation { .. } => {
                "review the blocked changes manually; do not re-run the agent"
            }
            Self::ContractInvalid(_) => {
                "inspect the agent transcript and escalate to a human (NEEDS_HUMAN)"
            }
            Self::TestsFailing { environment: true, .. } => {
                "fix the test tooling/environment, then re-run"
            }
            Self::TestsFailing { .. } => "review the failing tests; the agent could not fix them",
            Self::AgentTimeout { .. } | Self::CommandTimeout { .. } => {
                "check the agent/tooling installation and raise the timeout if needed"
            }
            Self::Auth { .. } => "refresh the stored credentials, then re-run",
            Self::Transient { .. } => "wait for the remote service to recover, then re-run",
            Self::TicketNotFound { .. } => "verify the ticket key and source query",
            Self::RepoMissing { .. } => "clone the repository under the workspace root",
            Self::State(_) | Self::Other(_) => "inspect the run artifacts and logs",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::Violation;

    #[test]
    fn state_error_already_running_is_matchable() {
        let err = StateError::AlreadyRunning {
            ticket_key: "ABC-1".into(),
            run_id: "r1".into(),
        };
        assert!(matches!(err, StateError::AlreadyRunning { .. }));
        assert!(err.to_string().contains("ABC-1"));
    }

    #[test]
    fn mapping_ambiguity_needs_human() {
        let err = PipelineError::MappingAmbiguous {
            key: "ABC-1".into(),
            reason: "no mapping matched".into(),
        };
        assert_eq!(err.terminal_status(), RunStatus::NeedsHuman);
    }

    #[test]
    fn guardrail_violation_needs_human_and_names_paths() {
        let err = PipelineError::GuardrailViolation {
            violations: vec![Violation::DenyGlob {
                paths: vec![".github/workflows/ci.yml".into()],
            }],
        };
        assert_eq!(err.terminal_status(), RunStatus::NeedsHuman);
        assert!(err.to_string().contains(".github/workflows/ci.yml"));
    }

    #[test]
    fn test_failure_classification_splits_on_environment() {
        let env = PipelineError::TestsFailing {
            attempts: 1,
            environment: true,
        };
        let logic = PipelineError::TestsFailing {
            attempts: 1,
            environment: false,
        };
        assert_eq!(env.terminal_status(), RunStatus::Failed);
        assert_eq!(logic.terminal_status(), RunStatus::NeedsHuman);
    }

    #[test]
    fn contract_invalid_fails_but_suggests_escalation() {
        let err = PipelineError::ContractInvalid(ContractError::MissingMarker);
        assert_eq!(err.terminal_status(), RunStatus::Failed);
        assert!(err.suggested_action().contains("NEEDS_HUMAN"));
    }

    #[test]
    fn auth_and_transient_fail_without_needs_human() {
        let auth = PipelineError::Auth {
            service: "tickets".into(),
            message: "401".into(),
        };
        let transient = PipelineError::Transient {
            service: "tickets".into(),
            attempts: 3,
            message: "503".into(),
        };
        assert_eq!(auth.terminal_status(), RunStatus::Failed);
        assert_eq!(transient.terminal_status(), RunStatus::Failed);
    }
}
