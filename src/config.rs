//! Unified configuration for prforge.
//!
//! Reads `~/.prforge/config.toml` (or the path in `PRFORGE_CONFIG`).
//! String values may reference environment variables with `${VAR}`, which
//! are interpolated after parsing and before validation. The loaded
//! `AppConfig` is constructed once at startup and passed by reference into
//! every component — nothing in the core reads it as ambient global state.
//!
//! # Configuration File Format
//!
//! ```toml
//! [tickets]
//! base_url = "https://example.atlassian.net"
//! email = "bot@example.com"
//! api_token = "${TICKET_API_TOKEN}"
//! jql = "labels = agent-ready AND status = 'To Do'"
//! fields = ["summary", "description", "labels", "components"]
//!
//! [github]
//! owner = "example-org"
//!
//! [workspace]
//! root_dir = "~/work"
//! repo_allowlist = ["service-a", "service-b"]
//!
//! [workspace.repo_mapping]
//! "components:payments" = "service-a"
//!
//! [guardrails]
//! deny_globs = [".github/workflows/**", "migrations/**"]
//! max_files_changed = 40
//! max_diff_lines = 2000
//!
//! [agent]
//! command = "cursor-agent"
//! timeout_minutes = 45
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::guardrails::GuardrailPolicy;

/// Ticket source (Jira-compatible REST) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketsConfig {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    #[serde(default = "default_api_version")]
    pub api_version: u32,
    pub jql: String,
    #[serde(default = "default_ticket_fields")]
    pub fields: Vec<String>,
    #[serde(default)]
    pub comment_on_pr: bool,
}

fn default_api_version() -> u32 {
    3
}

fn default_ticket_fields() -> Vec<String> {
    vec![
        "summary".into(),
        "description".into(),
        "labels".into(),
        "components".into(),
    ]
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            email: String::new(),
            api_token: String::new(),
            api_version: default_api_version(),
            jql: String::new(),
            fields: default_ticket_fields(),
            comment_on_pr: false,
        }
    }
}

/// Pull-request host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub owner: String,
    /// Base branch for PRs; "auto" asks the repository which branch its
    /// remote HEAD points to.
    #[serde(default = "default_base_branch")]
    pub default_base_branch: String,
    #[serde(default = "default_true")]
    pub use_gh_cli: bool,
    #[serde(default = "default_true")]
    pub draft_pr: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_base_branch() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            default_base_branch: default_base_branch(),
            use_gh_cli: true,
            draft_pr: true,
            token: String::new(),
            reviewers: Vec::new(),
            labels: Vec::new(),
        }
    }
}

/// Where repositories live and which of them prforge may touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    /// Hard boundary: a resolved repo not in this list is refused.
    /// Empty list means every mapped repo is allowed.
    #[serde(default)]
    pub repo_allowlist: Vec<String>,
    /// Mapping keys: a bare field name (matches when present), or
    /// `field:value` / `field=value` (matches on equality or list
    /// membership).
    #[serde(default)]
    pub repo_mapping: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub single_repo_only: bool,
    /// Off by default: scanning ticket text for repo name hints.
    #[serde(default)]
    pub hint_inference: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: String::new(),
            repo_allowlist: Vec::new(),
            repo_mapping: BTreeMap::new(),
            single_repo_only: true,
            hint_inference: false,
        }
    }
}

/// Policy bounding what an agent run may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    #[serde(default)]
    pub deny_globs: Vec<String>,
    #[serde(default)]
    pub command_denylist: Vec<String>,
    #[serde(default = "default_max_files_changed")]
    pub max_files_changed: usize,
    #[serde(default = "default_max_diff_lines")]
    pub max_diff_lines: u64,
    #[serde(default = "default_true")]
    pub require_clean_worktree: bool,
    #[serde(default = "default_true")]
    pub require_tests: bool,
    /// "auto" detects the command from repo build files.
    #[serde(default = "default_test_command")]
    pub test_command: String,
    #[serde(default)]
    pub format_command: String,
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
}

fn default_max_files_changed() -> usize {
    40
}

fn default_max_diff_lines() -> u64 {
    2000
}

fn default_test_command() -> String {
    "auto".to_string()
}

fn default_max_fix_attempts() -> u32 {
    1
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            deny_globs: Vec::new(),
            command_denylist: Vec::new(),
            max_files_changed: default_max_files_changed(),
            max_diff_lines: default_max_diff_lines(),
            require_clean_worktree: true,
            require_tests: true,
            test_command: default_test_command(),
            format_command: String::new(),
            max_fix_attempts: default_max_fix_attempts(),
        }
    }
}

impl GuardrailsConfig {
    pub fn policy(&self) -> GuardrailPolicy {
        GuardrailPolicy {
            deny_globs: self.deny_globs.clone(),
            command_denylist: self.command_denylist.clone(),
            max_files_changed: self.max_files_changed,
            max_diff_lines: self.max_diff_lines,
        }
    }
}

/// Headless coding agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent executable, e.g. "cursor-agent" or "claude".
    pub command: String,
    #[serde(default = "default_agent_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default)]
    pub prompt_template_path: String,
}

fn default_agent_timeout_minutes() -> u64 {
    45
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_minutes: default_agent_timeout_minutes(),
            prompt_template_path: String::new(),
        }
    }
}

/// Session recording settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_session_dir")]
    pub output_dir: String,
    #[serde(default = "default_true")]
    pub include_config: bool,
    /// 0 disables pruning.
    #[serde(default)]
    pub retention_days: u64,
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,
}

fn default_session_dir() -> String {
    "~/.prforge/sessions".to_string()
}

fn default_redact_patterns() -> Vec<String> {
    vec![
        "token".into(),
        "password".into(),
        "secret".into(),
        "api_key".into(),
    ]
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_session_dir(),
            include_config: true,
            retention_days: 0,
            redact_patterns: default_redact_patterns(),
        }
    }
}

/// State store and network retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Defaults to `<prforge home>/state.sqlite`.
    #[serde(default)]
    pub db_path: String,
    #[serde(default = "default_lock_stale_after_minutes")]
    pub lock_stale_after_minutes: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_lock_stale_after_minutes() -> u64 {
    120
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            lock_stale_after_minutes: default_lock_stale_after_minutes(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub tickets: TicketsConfig,
    pub github: GitHubConfig,
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl AppConfig {
    /// Validate values the type system cannot: returns every problem found
    /// rather than stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.tickets.base_url.is_empty() {
            errors.push("tickets.base_url is required".to_string());
        }
        if self.tickets.jql.is_empty() {
            errors.push("tickets.jql is required".to_string());
        }
        if self.github.owner.is_empty() {
            errors.push("github.owner is required".to_string());
        }
        if !self.github.use_gh_cli && self.github.token.is_empty() {
            errors.push(
                "github.token (or GITHUB_TOKEN) is required when use_gh_cli is false".to_string(),
            );
        }
        if self.workspace.root_dir.is_empty() {
            errors.push("workspace.root_dir is required".to_string());
        }
        if self.agent.command.is_empty() {
            errors.push("agent.command is required".to_string());
        }
        for pattern in &self.guardrails.deny_globs {
            if glob::Pattern::new(pattern).is_err() {
                errors.push(format!("guardrails.deny_globs: invalid pattern `{}`", pattern));
            }
        }
        if self.agent.timeout_minutes == 0 {
            errors.push("agent.timeout_minutes must be at least 1".to_string());
        }
        errors
    }

    /// GitHub token from config or the `GITHUB_TOKEN` environment variable.
    pub fn github_token(&self) -> String {
        if !self.github.token.is_empty() {
            return self.github.token.clone();
        }
        std::env::var("GITHUB_TOKEN").unwrap_or_default()
    }

    pub fn db_path(&self) -> PathBuf {
        if self.state.db_path.is_empty() {
            prforge_home().join("state.sqlite")
        } else {
            expand_home(&self.state.db_path)
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        expand_home(&self.session.output_dir)
    }

    pub fn workspace_root(&self) -> PathBuf {
        expand_home(&self.workspace.root_dir)
    }

    pub fn repo_path(&self, repo: &str) -> PathBuf {
        self.workspace_root().join(repo)
    }
}

/// Result of a config load attempt: either a config or the reasons it
/// could not be produced.
#[derive(Debug)]
pub struct ConfigResult {
    pub config: Option<AppConfig>,
    pub errors: Vec<String>,
}

/// prforge home directory (`~/.prforge`).
pub fn prforge_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".prforge")
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Config path override from the environment.
pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("PRFORGE_CONFIG").ok().map(PathBuf::from)
}

fn default_config_path() -> PathBuf {
    prforge_home().join("config.toml")
}

/// Load and validate configuration from `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> ConfigResult {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !config_path.exists() {
        return ConfigResult {
            config: None,
            errors: vec![format!("Config not found at {}", config_path.display())],
        };
    }

    let raw = match std::fs::read_to_string(&config_path) {
        Ok(raw) => raw,
        Err(e) => {
            return ConfigResult {
                config: None,
                errors: vec![format!("Failed to read {}: {}", config_path.display(), e)],
            };
        }
    };

    match parse_config(&raw) {
        Ok(config) => {
            let errors = config.validate();
            if errors.is_empty() {
                ConfigResult {
                    config: Some(config),
                    errors: vec![],
                }
            } else {
                ConfigResult {
                    config: None,
                    errors,
                }
            }
        }
        Err(e) => ConfigResult {
            config: None,
            errors: vec![format!("{:#}", e)],
        },
    }
}

/// Parse TOML text into an `AppConfig`, interpolating `${VAR}` references
/// in string values first.
pub fn parse_config(raw: &str) -> Result<AppConfig> {
    let value: toml::Value = raw.parse().context("Invalid TOML")?;
    let interpolated = interpolate_env(value);
    interpolated
        .try_into()
        .context("Config does not match the expected schema")
}

static ENV_PATTERN: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"\$\{([A-Z0-9_]+)\}").expect("valid env pattern"));

fn interpolate_env(value: toml::Value) -> toml::Value {
    interpolate_value(value, &ENV_PATTERN)
}

fn interpolate_value(value: toml::Value, pattern: &Regex) -> toml::Value {
    match value {
        toml::Value::String(s) => {
            let replaced = pattern.replace_all(&s, |caps: &regex::Captures<'_>| {
                std::env::var(&caps[1]).unwrap_or_default()
            });
            toml::Value::String(replaced.into_owned())
        }
        toml::Value::Array(items) => toml::Value::Array(
            items
                .into_iter()
                .map(|v| interpolate_value(v, pattern))
                .collect(),
        ),
        toml::Value::Table(table) => toml::Value::Table(
            table
                .into_iter()
                .map(|(k, v)| (k, interpolate_value(v, pattern)))
                .collect(),
        ),
        other => other,
    }
}
