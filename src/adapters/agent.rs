//! Headless coding agent adapter.
//!
//! One capability: hand the agent a prompt in a working directory and get
//! back whatever it printed, bounded by a timeout. The transcript comes
//! back even when the process times out or exits non-zero — the recorder
//! and artifacts always get the raw output.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::run_with_timeout;

/// Raw result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub exit_code: i32,
    /// stdout and stderr, stdout first.
    pub transcript: String,
    pub timed_out: bool,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<AgentInvocation>;
}

/// Spawns the configured agent binary with `--print <prompt>`.
pub struct HeadlessAgent {
    command: String,
}

impl HeadlessAgent {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl AgentInvoker for HeadlessAgent {
    async fn invoke(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<AgentInvocation> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--print").arg(prompt).current_dir(cwd);
        // New process group so a timeout kill does not orphan grandchildren
        // holding the output pipes open.
        #[cfg(unix)]
        cmd.process_group(0);

        let output = run_with_timeout(cmd, timeout)
            .await
            .with_context(|| format!("Failed to spawn agent `{}`", self.command))?;

        Ok(AgentInvocation {
            exit_code: output.exit_code,
            transcript: format!("{}\n{}", output.stdout, output.stderr),
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A stand-in agent script that echoes a canned footer.
    fn fake_agent(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn transcript_captures_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let agent = HeadlessAgent::new(&fake_agent(
            dir.path(),
            "echo working...; echo warning >&2; echo done",
        ));
        let result = agent
            .invoke("prompt", dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert!(result.transcript.contains("working..."));
        assert!(result.transcript.contains("warning"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_an_error() {
        let dir = TempDir::new().unwrap();
        let agent = HeadlessAgent::new(&fake_agent(dir.path(), "echo partial; exit 7"));
        let result = agent
            .invoke("prompt", dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(result.transcript.contains("partial"));
    }

    #[tokio::test]
    async fn timeout_kills_the_agent() {
        let dir = TempDir::new().unwrap();
        let agent = HeadlessAgent::new(&fake_agent(dir.path(), "sleep 60"));
        let result = agent
            .invoke("prompt", dir.path(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn missing_agent_binary_is_an_error() {
        let dir = TempDir::new().unwrap();
        let agent = HeadlessAgent::new("/nonexistent/agent-binary");
        assert!(
            agent
                .invoke("prompt", dir.path(), Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
