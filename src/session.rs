//! Structured session recording.
//!
//! Every run appends timestamped events to
//! `<sessions>/<ticket>/<run_id>/session_events.jsonl` and, on finish,
//! writes `session_manifest.json`. The manifest is a pure projection of
//! the event list — `Manifest::from_events` can always rebuild it from
//! the raw stream, which stays the source of truth.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SessionConfig;

pub const EVENTS_FILE: &str = "session_events.jsonl";
pub const MANIFEST_FILE: &str = "session_manifest.json";

/// Closed vocabulary of recordable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    ConfigSnapshot,
    RunInitiated,
    WorktreeCheckStarted,
    WorktreeCheckFinished,
    BranchSetupStarted,
    BranchSetupFinished,
    AgentInvocationStarted,
    AgentInvocationFinished,
    ContractParsed,
    ContractInvalid,
    FormatStarted,
    FormatFinished,
    TestsStarted,
    TestsFinished,
    TestFixCycle,
    GuardrailsCheckStarted,
    GuardrailsCheckFinished,
    GuardrailViolation,
    PrLookupStarted,
    ExistingPrFound,
    PrCreationStarted,
    PrCreationFinished,
    CommentPosted,
    CommentFailed,
    RetryScheduled,
    RunSucceeded,
    RunFailed,
    SessionError,
    SessionFinished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::ConfigSnapshot => "config_snapshot",
            Self::RunInitiated => "run_initiated",
            Self::WorktreeCheckStarted => "worktree_check_started",
            Self::WorktreeCheckFinished => "worktree_check_finished",
            Self::BranchSetupStarted => "branch_setup_started",
            Self::BranchSetupFinished => "branch_setup_finished",
            Self::AgentInvocationStarted => "agent_invocation_started",
            Self::AgentInvocationFinished => "agent_invocation_finished",
            Self::ContractParsed => "contract_parsed",
            Self::ContractInvalid => "contract_invalid",
            Self::FormatStarted => "format_started",
            Self::FormatFinished => "format_finished",
            Self::TestsStarted => "tests_started",
            Self::TestsFinished => "tests_finished",
            Self::TestFixCycle => "test_fix_cycle",
            Self::GuardrailsCheckStarted => "guardrails_check_started",
            Self::GuardrailsCheckFinished => "guardrails_check_finished",
            Self::GuardrailViolation => "guardrail_violation",
            Self::PrLookupStarted => "pr_lookup_started",
            Self::ExistingPrFound => "existing_pr_found",
            Self::PrCreationStarted => "pr_creation_started",
            Self::PrCreationFinished => "pr_creation_finished",
            Self::CommentPosted => "comment_posted",
            Self::CommentFailed => "comment_failed",
            Self::RetryScheduled => "retry_scheduled",
            Self::RunSucceeded => "run_succeeded",
            Self::RunFailed => "run_failed",
            Self::SessionError => "session_error",
            Self::SessionFinished => "session_finished",
        }
    }
}

/// One appended record. Read-only once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub ts: String,
    pub elapsed_s: f64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Machine-readable session summary, derivable from the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub ticket: String,
    pub run_id: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub elapsed_s: f64,
    pub event_count: usize,
    pub event_names: Vec<String>,
    pub errors: Vec<Value>,
}

impl Manifest {
    /// Rebuild the manifest from a raw event stream. This is the same
    /// computation `SessionRecorder::finish` performs, exposed so the
    /// stream stays independently reconstructible.
    pub fn from_events(ticket: &str, run_id: &str, events: &[SessionEvent]) -> Self {
        let errors = events
            .iter()
            .filter(|e| e.event == EventKind::SessionError.as_str())
            .map(|e| e.data.clone())
            .collect();
        Self {
            version: 1,
            ticket: ticket.to_string(),
            run_id: run_id.to_string(),
            started_at: events.first().map(|e| e.ts.clone()),
            finished_at: events.last().map(|e| e.ts.clone()),
            elapsed_s: events.last().map(|e| e.elapsed_s).unwrap_or(0.0),
            event_count: events.len(),
            event_names: events.iter().map(|e| e.event.clone()).collect(),
            errors,
        }
    }
}

/// A listed session: its manifest plus where it lives on disk.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub manifest: Manifest,
    pub session_path: PathBuf,
}

/// Append-only recorder for one run. When the config disables capture,
/// every method is a no-op.
pub struct SessionRecorder {
    enabled: bool,
    session_dir: Option<PathBuf>,
    started: Instant,
    events: Vec<SessionEvent>,
    events_file: Option<File>,
    redaction: Regex,
    ticket: String,
    run_id: String,
}

impl SessionRecorder {
    pub fn new(cfg: &SessionConfig, root: &Path, ticket: &str, run_id: &str) -> Result<Self> {
        let redaction = build_redaction_re(&cfg.redact_patterns);
        if !cfg.enabled {
            return Ok(Self {
                enabled: false,
                session_dir: None,
                started: Instant::now(),
                events: Vec::new(),
                events_file: None,
                redaction,
                ticket: ticket.to_string(),
                run_id: run_id.to_string(),
            });
        }

        let session_dir = root.join(ticket).join(run_id);
        std::fs::create_dir_all(&session_dir)
            .with_context(|| format!("Failed to create {}", session_dir.display()))?;
        let events_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(session_dir.join(EVENTS_FILE))
            .context("Failed to open session event log")?;

        let mut recorder = Self {
            enabled: true,
            session_dir: Some(session_dir),
            started: Instant::now(),
            events: Vec::new(),
            events_file: Some(events_file),
            redaction,
            ticket: ticket.to_string(),
            run_id: run_id.to_string(),
        };
        recorder.event(EventKind::SessionStarted, serde_json::json!({}));
        Ok(recorder)
    }

    /// A recorder that records nothing (capture disabled or unavailable).
    pub fn disabled(ticket: &str, run_id: &str) -> Self {
        Self {
            enabled: false,
            session_dir: None,
            started: Instant::now(),
            events: Vec::new(),
            events_file: None,
            redaction: build_redaction_re(&[]),
            ticket: ticket.to_string(),
            run_id: run_id.to_string(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn session_dir(&self) -> Option<&Path> {
        self.session_dir.as_deref()
    }

    /// Append one event. Capture failures never interrupt the run; the
    /// event is still kept in memory for the manifest.
    pub fn event(&mut self, kind: EventKind, data: Value) {
        if !self.enabled {
            return;
        }
        let entry = SessionEvent {
            ts: chrono::Utc::now().to_rfc3339(),
            elapsed_s: round3(self.started.elapsed().as_secs_f64()),
            event: kind.as_str().to_string(),
            data: redact_value(data, &self.redaction),
        };
        if let Some(file) = &mut self.events_file
            && let Ok(line) = serde_json::to_string(&entry)
        {
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
        self.events.push(entry);
    }

    /// Record a redacted snapshot of the effective configuration.
    pub fn snapshot_config<T: Serialize>(&mut self, config: &T) {
        if !self.enabled {
            return;
        }
        match serde_json::to_value(config) {
            Ok(value) => self.event(EventKind::ConfigSnapshot, value),
            Err(e) => self.event(
                EventKind::SessionError,
                serde_json::json!({"error_type": "config_snapshot", "error_message": e.to_string()}),
            ),
        }
    }

    /// Record the closing events and write the manifest. Consumes the
    /// recorder: a finished session is immutable.
    pub fn finish(mut self, exit_reason: &str) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        self.event(
            EventKind::SessionFinished,
            serde_json::json!({ "exit_reason": exit_reason }),
        );
        let manifest = Manifest::from_events(&self.ticket, &self.run_id, &self.events);
        let dir = self
            .session_dir
            .clone()
            .context("enabled recorder must have a session dir")?;
        let manifest_path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(&manifest).context("Failed to serialize manifest")?;
        std::fs::write(&manifest_path, json).context("Failed to write session manifest")?;
        Ok(Some(dir))
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// "a^" can never match: no position follows both an 'a' and start-of-text.
static MATCH_NOTHING: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new("a^").expect("valid regex"));

fn build_redaction_re(patterns: &[String]) -> Regex {
    if patterns.is_empty() {
        return MATCH_NOTHING.clone();
    }
    let escaped: Vec<String> = patterns.iter().map(|p| regex::escape(p)).collect();
    Regex::new(&format!("(?i){}", escaped.join("|"))).unwrap_or_else(|_| MATCH_NOTHING.clone())
}

/// Recursively replace values whose keys match the redaction pattern.
fn redact_value(value: Value, redaction: &Regex) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if redaction.is_match(&k) {
                        (k, Value::String("***REDACTED***".to_string()))
                    } else {
                        (k, redact_value(v, redaction))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| redact_value(v, redaction))
                .collect(),
        ),
        other => other,
    }
}

// ── listing / reading / pruning ──────────────────────────────────────

/// All recorded sessions under `root`, newest first.
pub fn list_sessions(root: &Path) -> Result<Vec<SessionSummary>> {
    let mut sessions = Vec::new();
    if !root.exists() {
        return Ok(sessions);
    }
    for ticket_entry in std::fs::read_dir(root)? {
        let ticket_dir = ticket_entry?.path();
        if !ticket_dir.is_dir() {
            continue;
        }
        for run_entry in std::fs::read_dir(&ticket_dir)? {
            let session_dir = run_entry?.path();
            let manifest_path = session_dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(&manifest_path) else {
                continue;
            };
            let Ok(manifest) = serde_json::from_str::<Manifest>(&raw) else {
                continue;
            };
            sessions.push(SessionSummary {
                manifest,
                session_path: session_dir,
            });
        }
    }
    sessions.sort_by(|a, b| b.manifest.finished_at.cmp(&a.manifest.finished_at));
    Ok(sessions)
}

/// Read the raw event stream of one session. Lines that fail to parse are
/// skipped rather than poisoning the whole read.
pub fn read_events(session_dir: &Path) -> Result<Vec<SessionEvent>> {
    let path = session_dir.join(EVENTS_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Remove sessions older than `retention_days`. Operates on whole run
/// directories: the manifest is deleted first so a partially-removed
/// session is never listed, then the rest of the directory goes.
pub fn prune_sessions(root: &Path, retention_days: u64) -> Result<usize> {
    if retention_days == 0 || !root.exists() {
        return Ok(0);
    }
    let cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(retention_days * 86_400));
    let Some(cutoff) = cutoff else {
        return Ok(0);
    };

    let mut removed = 0;
    for ticket_entry in std::fs::read_dir(root)? {
        let ticket_dir = ticket_entry?.path();
        if !ticket_dir.is_dir() {
            continue;
        }
        for run_entry in std::fs::read_dir(&ticket_dir)? {
            let session_dir = run_entry?.path();
            let manifest_path = session_dir.join(MANIFEST_FILE);
            let Ok(meta) = std::fs::metadata(&manifest_path) else {
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            if mtime < cutoff {
                std::fs::remove_file(&manifest_path)
                    .with_context(|| format!("Failed to remove {}", manifest_path.display()))?;
                std::fs::remove_dir_all(&session_dir)
                    .with_context(|| format!("Failed to remove {}", session_dir.display()))?;
                removed += 1;
            }
        }
        // Drop ticket dirs left empty by pruning.
        if std::fs::read_dir(&ticket_dir)?.next().is_none() {
            let _ = std::fs::remove_dir(&ticket_dir);
        }
    }
    Ok(removed)
}
