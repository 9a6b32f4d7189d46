//! Per-run artifact directory.
//!
//! Each run keeps its raw agent transcript, repo-status snapshots, final
//! diff, command list, and structured summary under
//! `<runs root>/<ticket>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::prforge_home;

pub const TRANSCRIPT_FILE: &str = "agent_transcript.log";

/// Root of the artifact tree for one run.
pub fn artifacts_root(ticket_key: &str, run_id: &str) -> PathBuf {
    prforge_home().join("runs").join(ticket_key).join(run_id)
}

/// Write one text artifact, creating the run directory as needed.
pub fn write_artifact(base: &Path, name: &str, content: &str) -> Result<()> {
    std::fs::create_dir_all(base)
        .with_context(|| format!("Failed to create {}", base.display()))?;
    let path = base.join(name);
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Write one JSON artifact, pretty-printed.
pub fn write_artifact_json<T: Serialize>(base: &Path, name: &str, payload: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(payload)
        .with_context(|| format!("Failed to serialize artifact {}", name))?;
    write_artifact(base, name, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_artifact_creates_directories() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("ABC-1").join("run-1");
        write_artifact(&base, "pre_git_status.txt", "M src/app.rs\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(base.join("pre_git_status.txt")).unwrap(),
            "M src/app.rs\n"
        );
    }

    #[test]
    fn write_artifact_json_is_pretty_printed() {
        let dir = TempDir::new().unwrap();
        write_artifact_json(
            dir.path(),
            "summary.json",
            &serde_json::json!({"pr_url": "http://pr/1"}),
        )
        .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("summary.json")).unwrap();
        assert!(raw.contains("\n"));
        assert!(raw.contains("http://pr/1"));
    }
}
