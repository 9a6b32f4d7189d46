//! Guardrail policy evaluation.
//!
//! A pure policy evaluator: it sees a description of what changed (paths,
//! line counts, commands run) and a policy, and produces a verdict. It has
//! no knowledge of git or the agent, so it can be tested in isolation with
//! synthetic changesets.

use glob::Pattern;
use serde::{Deserialize, Serialize};

/// One changed file with its line deltas, as reported by the repo adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: String,
    pub added: u64,
    pub removed: u64,
}

impl ChangedFile {
    pub fn new(path: impl Into<String>, added: u64, removed: u64) -> Self {
        Self {
            path: path.into(),
            added,
            removed,
        }
    }
}

/// The full proposed changeset: changed files plus every shell command the
/// run has executed so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Changeset {
    pub files: Vec<ChangedFile>,
    pub commands: Vec<String>,
}

impl Changeset {
    pub fn total_lines(&self) -> u64 {
        self.files.iter().map(|f| f.added + f.removed).sum()
    }
}

/// The policy bounding what an agent run may change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardrailPolicy {
    pub deny_globs: Vec<String>,
    pub command_denylist: Vec<String>,
    pub max_files_changed: usize,
    pub max_diff_lines: u64,
}

/// A single violated rule, with the offending paths or counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Violation {
    /// Every changed path matching a deny glob, not just the first.
    DenyGlob { paths: Vec<String> },
    DeniedCommand { command: String, needle: String },
    MaxFiles { changed: usize, limit: usize },
    MaxLines { changed: u64, limit: u64 },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DenyGlob { paths } => {
                write!(f, "deny glob matched: {}", paths.join(", "))
            }
            Self::DeniedCommand { command, needle } => {
                write!(f, "denied command `{}` (matched `{}`)", command, needle)
            }
            Self::MaxFiles { changed, limit } => {
                write!(f, "{} files changed (limit {})", changed, limit)
            }
            Self::MaxLines { changed, limit } => {
                write!(f, "{} lines changed (limit {})", changed, limit)
            }
        }
    }
}

/// Outcome of one guardrail evaluation. A single violation denies the
/// whole changeset; there is no partial allowance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GuardrailVerdict {
    Allow,
    Deny { violations: Vec<Violation> },
}

impl GuardrailVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Allow => &[],
            Self::Deny { violations } => violations,
        }
    }
}

fn matches_any_glob(path: &str, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|p| p.matches(path))
}

/// Evaluate a changeset against a policy.
///
/// Deny globs are checked first; any match is an immediate deny listing
/// every matching path. The command denylist comes next. Size limits are
/// evaluated last and independently — if both files and lines breach,
/// both violations are reported.
pub fn evaluate(changeset: &Changeset, policy: &GuardrailPolicy) -> GuardrailVerdict {
    // Invalid patterns deny nothing rather than everything; config
    // validation rejects them before a run starts.
    let patterns: Vec<Pattern> = policy
        .deny_globs
        .iter()
        .filter_map(|g| Pattern::new(g).ok())
        .collect();

    let blocked: Vec<String> = changeset
        .files
        .iter()
        .filter(|f| matches_any_glob(&f.path, &patterns))
        .map(|f| f.path.clone())
        .collect();
    if !blocked.is_empty() {
        return GuardrailVerdict::Deny {
            violations: vec![Violation::DenyGlob { paths: blocked }],
        };
    }

    for command in &changeset.commands {
        for needle in &policy.command_denylist {
            if !needle.is_empty() && command.contains(needle.as_str()) {
                return GuardrailVerdict::Deny {
                    violations: vec![Violation::DeniedCommand {
                        command: command.clone(),
                        needle: needle.clone(),
                    }],
                };
            }
        }
    }

    let mut violations = Vec::new();
    if changeset.files.len() > policy.max_files_changed {
        violations.push(Violation::MaxFiles {
            changed: changeset.files.len(),
            limit: policy.max_files_changed,
        });
    }
    let lines = changeset.total_lines();
    if lines > policy.max_diff_lines {
        violations.push(Violation::MaxLines {
            changed: lines,
            limit: policy.max_diff_lines,
        });
    }

    if violations.is_empty() {
        GuardrailVerdict::Allow
    } else {
        GuardrailVerdict::Deny { violations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GuardrailPolicy {
        GuardrailPolicy {
            deny_globs: vec![".github/workflows/**".into(), "migrations/**".into()],
            command_denylist: vec!["rm -rf".into()],
            max_files_changed: 5,
            max_diff_lines: 100,
        }
    }

    fn files(paths: &[&str]) -> Vec<ChangedFile> {
        paths.iter().map(|p| ChangedFile::new(*p, 1, 0)).collect()
    }

    #[test]
    fn empty_changeset_is_allowed() {
        let verdict = evaluate(&Changeset::default(), &policy());
        assert!(verdict.is_allow());
    }

    #[test]
    fn clean_changeset_is_allowed() {
        let changeset = Changeset {
            files: files(&["src/app.rs", "src/lib.rs"]),
            commands: vec!["cargo test".into()],
        };
        assert!(evaluate(&changeset, &policy()).is_allow());
    }

    #[test]
    fn single_denied_path_among_clean_ones_denies_everything() {
        let changeset = Changeset {
            files: files(&["src/a.rs", ".github/workflows/ci.yml", "src/b.rs"]),
            commands: vec![],
        };
        let verdict = evaluate(&changeset, &policy());
        assert_eq!(
            verdict,
            GuardrailVerdict::Deny {
                violations: vec![Violation::DenyGlob {
                    paths: vec![".github/workflows/ci.yml".into()],
                }],
            }
        );
    }

    #[test]
    fn deny_glob_lists_every_matching_path() {
        let changeset = Changeset {
            files: files(&[
                ".github/workflows/ci.yml",
                "migrations/001.sql",
                "src/ok.rs",
            ]),
            commands: vec![],
        };
        match evaluate(&changeset, &policy()) {
            GuardrailVerdict::Deny { violations } => {
                assert_eq!(
                    violations,
                    vec![Violation::DenyGlob {
                        paths: vec![
                            ".github/workflows/ci.yml".into(),
                            "migrations/001.sql".into(),
                        ],
                    }]
                );
            }
            GuardrailVerdict::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn deny_glob_short_circuits_size_checks() {
        // 10 files > max 5, but the glob violation is the only one reported.
        let mut paths: Vec<ChangedFile> = (0..10)
            .map(|i| ChangedFile::new(format!("src/f{}.rs", i), 50, 50))
            .collect();
        paths.push(ChangedFile::new("migrations/002.sql", 1, 0));
        let changeset = Changeset {
            files: paths,
            commands: vec![],
        };
        let verdict = evaluate(&changeset, &policy());
        assert_eq!(verdict.violations().len(), 1);
        assert!(matches!(verdict.violations()[0], Violation::DenyGlob { .. }));
    }

    #[test]
    fn denied_command_is_reported() {
        let changeset = Changeset {
            files: files(&["src/a.rs"]),
            commands: vec!["rm -rf build".into()],
        };
        match evaluate(&changeset, &policy()) {
            GuardrailVerdict::Deny { violations } => {
                assert!(matches!(violations[0], Violation::DeniedCommand { .. }));
            }
            GuardrailVerdict::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn file_and_line_limits_are_independent_and_both_listed() {
        let changeset = Changeset {
            files: (0..6)
                .map(|i| ChangedFile::new(format!("src/f{}.rs", i), 30, 0))
                .collect(),
            commands: vec![],
        };
        match evaluate(&changeset, &policy()) {
            GuardrailVerdict::Deny { violations } => {
                assert_eq!(violations.len(), 2);
                assert!(violations.iter().any(|v| matches!(v, Violation::MaxFiles { changed: 6, limit: 5 })));
                assert!(violations.iter().any(|v| matches!(v, Violation::MaxLines { changed: 180, limit: 100 })));
            }
            GuardrailVerdict::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn line_limit_alone_reports_only_lines() {
        let changeset = Changeset {
            files: vec![ChangedFile::new("src/big.rs", 200, 0)],
            commands: vec![],
        };
        match evaluate(&changeset, &policy()) {
            GuardrailVerdict::Deny { violations } => {
                assert_eq!(violations.len(), 1);
                assert!(matches!(violations[0], Violation::MaxLines { .. }));
            }
            GuardrailVerdict::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn boundary_counts_are_allowed() {
        let changeset = Changeset {
            files: (0..5)
                .map(|i| ChangedFile::new(format!("src/f{}.rs", i), 20, 0))
                .collect(),
            commands: vec![],
        };
        assert!(evaluate(&changeset, &policy()).is_allow());
    }
}
