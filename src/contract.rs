//! Agent contract extraction.
//!
//! The agent must end its output with a single-line footer:
//!
//! ```text
//! PRFORGE_RESULT: {"decision":"proceed","summary":"...","risk":"low",...}
//! ```
//!
//! Agents sometimes emit partial or duplicate footers mid-reasoning, so
//! the *last* marker line in the output is authoritative. Parsing is
//! strict: malformed JSON, an unknown decision or risk value, or a
//! non-`proceed` decision without a blocking reason are all hard errors —
//! the orchestrator never guesses at partial intent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Line prefix the agent must use for its structured result.
pub const RESULT_MARKER: &str = "PRFORGE_RESULT:";

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("no PRFORGE_RESULT footer found in agent output")]
    MissingMarker,

    #[error("footer JSON malformed: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("decision `{decision}` requires a non-empty blocking_reason")]
    MissingBlockingReason { decision: String },
}

/// Closed ordinal risk scale the agent reports against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Test outcome the agent reports having observed locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestReport {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub notes: String,
}

/// The agent's decision, carrying only the fields that decision requires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Proceed,
    NeedsHuman { blocking_reason: String },
    Failed { blocking_reason: String },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::NeedsHuman { .. } => "needs_human",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// Validated structured decision extracted from agent output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentContract {
    #[serde(flatten)]
    pub decision: Decision,
    pub summary: String,
    pub changes: Vec<String>,
    pub tests: TestReport,
    pub risk: RiskLevel,
    pub repo: String,
    pub branch: String,
    pub commit_message: String,
    pub notes_for_reviewer: String,
}

/// Wire shape of the footer JSON. Extra fields are ignored; `decision`,
/// `summary` and `risk` are required.
#[derive(Debug, Deserialize)]
struct RawFooter {
    decision: RawDecision,
    summary: String,
    #[serde(default)]
    changes: Vec<String>,
    #[serde(default)]
    tests: TestReport,
    risk: RiskLevel,
    #[serde(default)]
    repo: String,
    #[serde(default)]
    branch: String,
    #[serde(default)]
    commit_message: String,
    #[serde(default)]
    notes_for_reviewer: String,
    #[serde(default)]
    blocking_reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawDecision {
    Proceed,
    NeedsHuman,
    Failed,
}

impl RawFooter {
    fn validate(self) -> Result<AgentContract, ContractError> {
        let decision = match self.decision {
            RawDecision::Proceed => Decision::Proceed,
            RawDecision::NeedsHuman => {
                if self.blocking_reason.trim().is_empty() {
                    return Err(ContractError::MissingBlockingReason {
                        decision: "needs_human".into(),
                    });
                }
                Decision::NeedsHuman {
                    blocking_reason: self.blocking_reason,
                }
            }
            RawDecision::Failed => {
                if self.blocking_reason.trim().is_empty() {
                    return Err(ContractError::MissingBlockingReason {
                        decision: "failed".into(),
                    });
                }
                Decision::Failed {
                    blocking_reason: self.blocking_reason,
                }
            }
        };
        Ok(AgentContract {
            decision,
            summary: self.summary,
            changes: self.changes,
            tests: self.tests,
            risk: self.risk,
            repo: self.repo,
            branch: self.branch,
            commit_message: self.commit_message,
            notes_for_reviewer: self.notes_for_reviewer,
        })
    }
}

/// Extract the contract from raw agent output.
///
/// Scans for marker lines; the last one wins. That line must parse and
/// validate completely — an earlier well-formed footer never rescues a
/// broken final one.
pub fn parse_contract(output: &str) -> Result<AgentContract, ContractError> {
    let footer_line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with(RESULT_MARKER))
        .ok_or(ContractError::MissingMarker)?;

    let raw_json = footer_line[RESULT_MARKER.len()..].trim();
    let raw: RawFooter = serde_json::from_str(raw_json)?;
    raw.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn footer(json: &str) -> String {
        format!("{} {}", RESULT_MARKER, json)
    }

    const PROCEED: &str = r#"{"decision":"proceed","summary":"fixed the bug","changes":["src/app.rs"],"tests":{"command":"cargo test","result":"pass","notes":""},"risk":"low","repo":"service-a","branch":"prforge/ABC-1-fix","commit_message":"fix","notes_for_reviewer":"","blocking_reason":""}"#;

    #[test]
    fn parses_a_proceed_footer() {
        let output = format!("thinking...\n{}\n", footer(PROCEED));
        let contract = parse_contract(&output).unwrap();
        assert!(contract.decision.is_proceed());
        assert_eq!(contract.summary, "fixed the bug");
        assert_eq!(contract.risk, RiskLevel::Low);
        assert_eq!(contract.changes, vec!["src/app.rs"]);
    }

    #[test]
    fn missing_marker_is_an_error() {
        let err = parse_contract("no footer here\njust text\n").unwrap_err();
        assert!(matches!(err, ContractError::MissingMarker));
    }

    #[test]
    fn last_footer_wins() {
        let first = footer(r#"{"decision":"failed","summary":"wip","risk":"high","blocking_reason":"partial"}"#);
        let second = footer(PROCEED);
        let output = format!("{}\nmore reasoning\n{}\n", first, second);
        let contract = parse_contract(&output).unwrap();
        assert!(contract.decision.is_proceed());
        assert_eq!(contract.summary, "fixed the bug");
    }

    #[test]
    fn malformed_final_footer_is_an_error_even_with_valid_earlier_one() {
        let output = format!("{}\n{} {{not json\n", footer(PROCEED), RESULT_MARKER);
        assert!(matches!(
            parse_contract(&output).unwrap_err(),
            ContractError::InvalidJson(_)
        ));
    }

    #[test]
    fn needs_human_without_reason_is_a_parse_failure() {
        let output = footer(
            r#"{"decision":"needs_human","summary":"unsure","risk":"medium","blocking_reason":""}"#,
        );
        let err = parse_contract(&output).unwrap_err();
        assert!(matches!(
            err,
            ContractError::MissingBlockingReason { ref decision } if decision == "needs_human"
        ));
    }

    #[test]
    fn failed_with_reason_is_valid() {
        let output = footer(
            r#"{"decision":"failed","summary":"could not build","risk":"high","blocking_reason":"missing toolchain"}"#,
        );
        let contract = parse_contract(&output).unwrap();
        assert_eq!(
            contract.decision,
            Decision::Failed {
                blocking_reason: "missing toolchain".into()
            }
        );
    }

    #[test]
    fn unknown_decision_value_is_rejected() {
        let output = footer(r#"{"decision":"maybe","summary":"x","risk":"low"}"#);
        assert!(matches!(
            parse_contract(&output).unwrap_err(),
            ContractError::InvalidJson(_)
        ));
    }

    #[test]
    fn unknown_risk_value_is_rejected() {
        let output = footer(r#"{"decision":"proceed","summary":"x","risk":"extreme"}"#);
        assert!(matches!(
            parse_contract(&output).unwrap_err(),
            ContractError::InvalidJson(_)
        ));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let output = footer(r#"{"decision":"proceed","risk":"low"}"#);
        assert!(matches!(
            parse_contract(&output).unwrap_err(),
            ContractError::InvalidJson(_)
        ));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let output = footer(
            r#"{"decision":"proceed","summary":"ok","risk":"low","confidence":0.9,"model":"x"}"#,
        );
        assert!(parse_contract(&output).is_ok());
    }

    #[test]
    fn indented_footer_line_still_matches() {
        let output = format!("  {}\n", footer(PROCEED));
        assert!(parse_contract(&output).is_ok());
    }
}
