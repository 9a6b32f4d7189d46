//! The run pipeline: request, outcome, and the state machine itself.

pub mod prompt;
pub mod runner;

pub use runner::Pipeline;

/// One invocation of `prforge run`.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub ticket_key: String,
    /// Skip the ticket-completeness and clean-worktree preconditions.
    pub force: bool,
    /// Run again even when a prior PR exists for this ticket.
    pub rerun: bool,
    /// Do not comment the PR URL back on the ticket.
    pub no_comment: bool,
}

impl RunRequest {
    pub fn new(ticket_key: &str) -> Self {
        Self {
            ticket_key: ticket_key.to_string(),
            ..Default::default()
        }
    }
}

/// Terminal result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A PR now exists for this ticket (created this run, or discovered
    /// on the host and adopted).
    PrOpened { pr_url: String, run_id: String },
    /// A prior outcome was returned without any side effect.
    Idempotent { pr_url: String },
    /// The repository lock is held by another live run. Not a failure;
    /// ticket state is untouched.
    Busy { repo: String, holder: String },
    NeedsHuman {
        reason: String,
        artifacts_dir: Option<String>,
        suggested_action: String,
    },
    Failed {
        reason: String,
        artifacts_dir: Option<String>,
        suggested_action: String,
    },
}

impl RunOutcome {
    /// CLI exit code: 0 success/idempotent, 2 needs-human (and busy),
    /// 3 failed.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PrOpened { .. } | Self::Idempotent { .. } => 0,
            Self::Busy { .. } | Self::NeedsHuman { .. } => 2,
            Self::Failed { .. } => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_cli_contract() {
        assert_eq!(
            RunOutcome::PrOpened {
                pr_url: "u".into(),
                run_id: "r".into()
            }
            .exit_code(),
            0
        );
        assert_eq!(RunOutcome::Idempotent { pr_url: "u".into() }.exit_code(), 0);
        assert_eq!(
            RunOutcome::Busy {
                repo: "r".into(),
                holder: "h".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            RunOutcome::NeedsHuman {
                reason: "r".into(),
                artifacts_dir: None,
                suggested_action: "a".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            RunOutcome::Failed {
                reason: "r".into(),
                artifacts_dir: None,
                suggested_action: "a".into()
            }
            .exit_code(),
            3
        );
    }
}
