//! Pull-request host adapter (GitHub).
//!
//! Lookup-before-create is the host-side idempotency guard: the pipeline
//! asks for an existing PR by branch and by ticket key before creating
//! one. No merge capability is exposed here at all.

use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::process::Command;

use super::{AdapterError, run_with_timeout};
use crate::config::GitHubConfig;

/// Everything needed to open one draft PR.
#[derive(Debug, Clone)]
pub struct CreatePr {
    pub title: String,
    pub body: String,
    pub base: String,
    pub head: String,
    pub draft: bool,
    pub reviewers: Vec<String>,
    pub labels: Vec<String>,
}

#[async_trait]
pub trait PrHost: Send + Sync {
    /// Open PR whose head is `branch`, if one exists.
    async fn find_by_branch(
        &self,
        repo: &str,
        branch: &str,
        cwd: &Path,
    ) -> Result<Option<String>, AdapterError>;

    /// Open PR mentioning the ticket key, if one exists. Covers PRs
    /// opened out of band on a different branch.
    async fn find_by_key(
        &self,
        repo: &str,
        key: &str,
        cwd: &Path,
    ) -> Result<Option<String>, AdapterError>;

    async fn create(
        &self,
        repo: &str,
        request: &CreatePr,
        cwd: &Path,
    ) -> Result<String, AdapterError>;
}

/// GitHub implementation: `gh` CLI when configured, REST otherwise.
pub struct GitHubHost {
    cfg: GitHubConfig,
    token: String,
    client: reqwest::Client,
}

const GH_TIMEOUT: Duration = Duration::from_secs(120);

impl GitHubHost {
    pub fn new(cfg: &GitHubConfig, token: String) -> Self {
        Self {
            cfg: cfg.clone(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn require_token(&self) -> Result<&str, AdapterError> {
        if self.token.is_empty() {
            return Err(AdapterError::Auth(
                "GitHub token required for REST operations".to_string(),
            ));
        }
        Ok(&self.token)
    }

    async fn gh(&self, cwd: &Path, args: &[String]) -> Result<super::CommandOutput, AdapterError> {
        let mut cmd = Command::new("gh");
        cmd.args(args).current_dir(cwd);
        let output = run_with_timeout(cmd, GH_TIMEOUT)
            .await
            .map_err(AdapterError::Other)?;
        if output.timed_out {
            return Err(AdapterError::Transient("gh CLI timed out".to_string()));
        }
        Ok(output)
    }

    /// First URL from a `gh pr list --json url` payload.
    fn first_url(raw: &str) -> Option<String> {
        let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
        parsed
            .as_array()?
            .first()?
            .get("url")?
            .as_str()
            .map(str::to_string)
    }

    async fn search_rest(&self, query: &str) -> Result<Option<String>, AdapterError> {
        let token = self.require_token()?;
        let url = format!("https://api.github.com/search/issues?q={}", query);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "prforge")
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest("github", e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AdapterError::from_reqwest("github", e))?;
        if !status.is_success() {
            return Err(AdapterError::from_status("github", status, &body));
        }
        let data: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| AdapterError::Other(anyhow!("github search response not JSON: {}", e)))?;
        Ok(data
            .get("items")
            .and_then(serde_json::Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("html_url"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string))
    }
}

#[async_trait]
impl PrHost for GitHubHost {
    async fn find_by_branch(
        &self,
        repo: &str,
        branch: &str,
        cwd: &Path,
    ) -> Result<Option<String>, AdapterError> {
        if self.cfg.use_gh_cli {
            let args: Vec<String> = [
                "pr", "list", "--state", "open", "--head", branch, "--json", "url",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect();
            let output = self.gh(cwd, &args).await?;
            if output.exit_code != 0 {
                // A repo with no PRs or a detached checkout is not an error.
                return Ok(None);
            }
            return Ok(Self::first_url(&output.stdout));
        }
        let query = format!(
            "repo:{}/{}+type:pr+head:{}:{}+state:open",
            self.cfg.owner, repo, self.cfg.owner, branch
        );
        self.search_rest(&query).await
    }

    async fn find_by_key(
        &self,
        repo: &str,
        key: &str,
        cwd: &Path,
    ) -> Result<Option<String>, AdapterError> {
        if self.cfg.use_gh_cli {
            let args: Vec<String> = [
                "pr", "list", "--state", "open", "--search", key, "--json", "url",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect();
            let output = self.gh(cwd, &args).await?;
            if output.exit_code != 0 {
                return Ok(None);
            }
            return Ok(Self::first_url(&output.stdout));
        }
        let query = format!(
            "repo:{}/{}+type:pr+state:open+{}",
            self.cfg.owner, repo, key
        );
        self.search_rest(&query).await
    }

    async fn create(
        &self,
        repo: &str,
        request: &CreatePr,
        cwd: &Path,
    ) -> Result<String, AdapterError> {
        if self.cfg.use_gh_cli {
            let mut args: Vec<String> = vec![
                "pr".into(),
                "create".into(),
                "--title".into(),
                request.title.clone(),
                "--body".into(),
                request.body.clone(),
                "--base".into(),
                request.base.clone(),
                "--head".into(),
                request.head.clone(),
            ];
            if request.draft {
                args.push("--draft".into());
            }
            for reviewer in &request.reviewers {
                args.push("--reviewer".into());
                args.push(reviewer.clone());
            }
            for label in &request.labels {
                args.push("--label".into());
                args.push(label.clone());
            }
            let output = self.gh(cwd, &args).await?;
            if output.exit_code != 0 {
                return Err(AdapterError::Other(anyhow!(
                    "gh pr create failed: {}",
                    output.stderr.trim()
                )));
            }
            // gh prints the PR URL as the last stdout line.
            return output
                .stdout
                .trim()
                .lines()
                .last()
                .map(str::to_string)
                .ok_or_else(|| AdapterError::Other(anyhow!("gh pr create printed no URL")));
        }

        let token = self.require_token()?;
        let url = format!(
            "https://api.github.com/repos/{}/{}/pulls",
            self.cfg.owner, repo
        );
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "prforge")
            .json(&serde_json::json!({
                "title": request.title,
                "body": request.body,
                "base": request.base,
                "head": request.head,
                "draft": request.draft,
            }))
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest("github", e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AdapterError::from_reqwest("github", e))?;
        if !status.is_success() {
            return Err(AdapterError::from_status("github", status, &body));
        }
        let data: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| AdapterError::Other(anyhow!("github create response not JSON: {}", e)))?;
        data.get("html_url")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Other(anyhow!("github create response missing html_url")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_url_reads_gh_json() {
        let raw = r#"[{"url": "https://github.com/o/r/pull/7"}]"#;
        assert_eq!(
            GitHubHost::first_url(raw),
            Some("https://github.com/o/r/pull/7".to_string())
        );
        assert_eq!(GitHubHost::first_url("[]"), None);
        assert_eq!(GitHubHost::first_url("not json"), None);
    }

    #[test]
    fn rest_mode_without_token_is_an_auth_error() {
        let host = GitHubHost::new(
            &GitHubConfig {
                owner: "o".into(),
                use_gh_cli: false,
                ..Default::default()
            },
            String::new(),
        );
        assert!(matches!(
            host.require_token(),
            Err(AdapterError::Auth(_))
        ));
    }
}
