//! Boundary adapters the orchestrator drives.
//!
//! Each adapter is a trait seam with one production implementation; the
//! pipeline only ever sees the trait, which is what lets the integration
//! tests substitute call-counting mocks.

pub mod agent;
pub mod host;
pub mod repo;
pub mod tickets;

pub use agent::{AgentInvocation, AgentInvoker, HeadlessAgent};
pub use host::{CreatePr, GitHubHost, PrHost};
pub use repo::{CommandOutput, GitCli, RepoAdapter};
pub use tickets::{JiraSource, TicketFields, TicketSource};

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Failure classes the pipeline's retry logic distinguishes.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Credentials rejected: never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Network/rate-limit weather: retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AdapterError {
    /// Classify a reqwest response status the way the retry loop expects.
    pub fn from_status(service: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("{} returned {}: {}", service, status, crate::util::truncate_str(body, 500));
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            Self::Auth(detail)
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient(detail)
        } else {
            Self::Other(anyhow::anyhow!(detail))
        }
    }

    pub fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Transient(format!("{} unreachable: {}", service, err))
        } else {
            Self::Other(anyhow::Error::new(err).context(format!("{} request failed", service)))
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Spawn `cmd` and wait for it under `timeout`, capturing stdout/stderr.
///
/// On timeout the process is killed and whatever output was read so far
/// is returned with `timed_out` set — a timed-out step still leaves a
/// transcript behind.
pub(crate) async fn run_with_timeout(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("Failed to spawn process")?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = String::new();
    let mut err_buf = String::new();

    let waited = tokio::time::timeout(timeout, async {
        let out_fut = async {
            if let Some(s) = stdout.as_mut() {
                let _ = s.read_to_string(&mut out_buf).await;
            }
        };
        let err_fut = async {
            if let Some(s) = stderr.as_mut() {
                let _ = s.read_to_string(&mut err_buf).await;
            }
        };
        tokio::join!(out_fut, err_fut);
        child.wait().await
    })
    .await;

    match waited {
        Ok(status) => {
            let status = status.context("Failed to wait for process")?;
            Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: out_buf,
                stderr: err_buf,
                timed_out: false,
            })
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(CommandOutput {
                exit_code: -1,
                stdout: out_buf,
                stderr: err_buf,
                timed_out: true,
            })
        }
    }
}
