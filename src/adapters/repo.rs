//! Repository/process adapter.
//!
//! All git work and every test/format command goes through this single
//! seam, so the pipeline can be exercised without a real repository.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use super::run_with_timeout;
use crate::guardrails::ChangedFile;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

#[async_trait]
pub trait RepoAdapter: Send + Sync {
    /// Clean-tree check: `(is_clean, porcelain status text)`.
    async fn ensure_clean(&self, path: &Path) -> Result<(bool, String)>;

    /// Which branch the remote HEAD points to, if discoverable.
    async fn detect_default_branch(&self, path: &Path) -> Result<Option<String>>;

    /// Fetch and reset to a pristine copy of the base branch, discarding
    /// leftovers from any previous run.
    async fn prepare_base(&self, path: &Path, base_branch: &str) -> Result<()>;

    async fn create_branch(&self, path: &Path, branch: &str) -> Result<()>;

    /// Changed files with added/removed line counts (`git diff` view).
    async fn changeset(&self, path: &Path) -> Result<Vec<ChangedFile>>;

    async fn diff_patch(&self, path: &Path) -> Result<String>;

    /// Test command inferred from repo build files, when recognizable.
    async fn detect_test_command(&self, path: &Path) -> Result<Option<String>>;

    async fn remote_branch_exists(&self, path: &Path, branch: &str) -> Result<bool>;

    async fn push_branch(&self, path: &Path, branch: &str) -> Result<()>;

    /// Run an arbitrary shell command with a timeout.
    async fn run_command(
        &self,
        cwd: &Path,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

/// Production implementation shelling out to git.
pub struct GitCli;

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

impl GitCli {
    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(cwd);
        run_with_timeout(cmd, GIT_TIMEOUT)
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> Result<CommandOutput> {
        let output = self.git(cwd, args).await?;
        if !output.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

#[async_trait]
impl RepoAdapter for GitCli {
    async fn ensure_clean(&self, path: &Path) -> Result<(bool, String)> {
        let output = self.git_ok(path, &["status", "--porcelain"]).await?;
        let status = output.stdout.trim().to_string();
        Ok((status.is_empty(), status))
    }

    async fn detect_default_branch(&self, path: &Path) -> Result<Option<String>> {
        let output = self
            .git(path, &["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await?;
        let reference = output.stdout.trim();
        if output.success() && !reference.is_empty() {
            return Ok(reference.rsplit('/').next().map(str::to_string));
        }
        // symbolic-ref can be unset; ask the remote directly.
        let output = self.git(path, &["remote", "show", "origin"]).await?;
        for line in output.stdout.lines() {
            if line.contains("HEAD branch")
                && let Some((_, branch)) = line.rsplit_once(':')
            {
                return Ok(Some(branch.trim().to_string()));
            }
        }
        Ok(None)
    }

    async fn prepare_base(&self, path: &Path, base_branch: &str) -> Result<()> {
        self.git_ok(path, &["fetch", "--all"]).await?;
        self.git_ok(path, &["checkout", "--force", base_branch])
            .await?;
        self.git_ok(path, &["reset", "--hard", &format!("origin/{}", base_branch)])
            .await?;
        self.git_ok(path, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn create_branch(&self, path: &Path, branch: &str) -> Result<()> {
        self.git_ok(path, &["checkout", "-B", branch]).await?;
        Ok(())
    }

    async fn changeset(&self, path: &Path) -> Result<Vec<ChangedFile>> {
        let output = self.git_ok(path, &["diff", "--numstat"]).await?;
        Ok(parse_numstat(&output.stdout))
    }

    async fn diff_patch(&self, path: &Path) -> Result<String> {
        let output = self.git_ok(path, &["diff"]).await?;
        Ok(output.stdout)
    }

    async fn detect_test_command(&self, path: &Path) -> Result<Option<String>> {
        Ok(detect_test_command_from_files(path))
    }

    async fn remote_branch_exists(&self, path: &Path, branch: &str) -> Result<bool> {
        let output = self
            .git_ok(path, &["ls-remote", "--heads", "origin", branch])
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    async fn push_branch(&self, path: &Path, branch: &str) -> Result<()> {
        self.git_ok(path, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    async fn run_command(
        &self,
        cwd: &Path,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(cwd);
        run_with_timeout(cmd, timeout)
            .await
            .with_context(|| format!("Failed to run `{}`", command))
    }
}

/// Parse `git diff --numstat` output. Binary files report `-` counts and
/// contribute zero lines.
pub fn parse_numstat(raw: &str) -> Vec<ChangedFile> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let added = parts.next()?.trim();
            let removed = parts.next()?.trim();
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }
            Some(ChangedFile {
                path: path.to_string(),
                added: added.parse().unwrap_or(0),
                removed: removed.parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Detection order (first match wins): package.json → npm, gradle →
/// gradlew, pom.xml → maven, Cargo.toml → cargo.
pub fn detect_test_command_from_files(path: &Path) -> Option<String> {
    if path.join("package.json").exists() {
        return Some("npm test".to_string());
    }
    if path.join("build.gradle").exists() || path.join("build.gradle.kts").exists() {
        return Some("./gradlew test".to_string());
    }
    if path.join("pom.xml").exists() {
        return Some("mvn test".to_string());
    }
    if path.join("Cargo.toml").exists() {
        return Some("cargo test".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn numstat_parsing_handles_binary_and_blank_lines() {
        let raw = "10\t2\tsrc/app.rs\n-\t-\tassets/logo.png\n\n3\t0\tREADME.md\n";
        let files = parse_numstat(raw);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0], ChangedFile::new("src/app.rs", 10, 2));
        assert_eq!(files[1], ChangedFile::new("assets/logo.png", 0, 0));
        assert_eq!(files[2], ChangedFile::new("README.md", 3, 0));
    }

    #[test]
    fn test_command_detection_order() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_test_command_from_files(dir.path()), None);

        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(
            detect_test_command_from_files(dir.path()),
            Some("cargo test".into())
        );

        // package.json outranks Cargo.toml.
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(
            detect_test_command_from_files(dir.path()),
            Some("npm test".into())
        );
    }

    #[tokio::test]
    async fn run_command_goes_through_the_shell() {
        let dir = TempDir::new().unwrap();
        let output = GitCli
            .run_command(dir.path(), "echo hello && echo oops >&2", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.combined().trim(), "hello\noops");
    }

    #[tokio::test]
    async fn run_command_reports_timeout() {
        let dir = TempDir::new().unwrap();
        let output = GitCli
            .run_command(dir.path(), "sleep 30", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
    }
}
