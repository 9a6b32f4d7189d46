//! The run state machine.
//!
//! One `Pipeline::run` call drives a single ticket through the full
//! sequence of checkpoints: idempotency check, ticket fetch, repo
//! mapping, lock acquisition, worktree precondition, branch preparation,
//! agent invocation, contract extraction, guardrail evaluation, the
//! bounded test/fix cycle, and PR finalization. Every checkpoint may
//! short-circuit to a terminal outcome; the repo lock is released and
//! `finish_run` is called exactly once on every exit path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use crate::adapters::{
    AdapterError, AgentInvoker, CreatePr, GitCli, GitHubHost, HeadlessAgent, JiraSource, PrHost,
    RepoAdapter, TicketFields, TicketSource,
};
use crate::artifacts::{self, TRANSCRIPT_FILE, artifacts_root};
use crate::config::AppConfig;
use crate::contract::{AgentContract, Decision, parse_contract};
use crate::errors::PipelineError;
use crate::guardrails::{self, Changeset, GuardrailVerdict};
use crate::mapping::resolve_repo;
use crate::pipeline::prompt::{PromptVars, build_prompt};
use crate::pipeline::{RunOutcome, RunRequest};
use crate::session::{EventKind, SessionRecorder};
use crate::state::{
    RunCompletion, RunStatus, StateHandle, TicketPatch, TicketStatus, new_run_id,
};
use crate::util::{backoff_delays, slugify};

/// Timeout for configured format/test commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1800);

pub struct Pipeline {
    config: Arc<AppConfig>,
    state: StateHandle,
    tickets: Arc<dyn TicketSource>,
    host: Arc<dyn PrHost>,
    repo: Arc<dyn RepoAdapter>,
    agent: Arc<dyn AgentInvoker>,
}

/// What a successful run hands back to the finalizer.
struct Finalized {
    pr_url: String,
    branch: String,
    agent_exit_code: Option<i32>,
    summary_json: String,
}

impl Pipeline {
    pub fn new(
        config: Arc<AppConfig>,
        state: StateHandle,
        tickets: Arc<dyn TicketSource>,
        host: Arc<dyn PrHost>,
        repo: Arc<dyn RepoAdapter>,
        agent: Arc<dyn AgentInvoker>,
    ) -> Self {
        Self {
            config,
            state,
            tickets,
            host,
            repo,
            agent,
        }
    }

    /// Wire up the production adapters from config.
    pub fn with_defaults(config: Arc<AppConfig>, state: StateHandle) -> Self {
        let tickets = Arc::new(JiraSource::new(&config.tickets));
        let host = Arc::new(GitHubHost::new(&config.github, config.github_token()));
        let agent = Arc::new(HeadlessAgent::new(&config.agent.command));
        Self::new(config, state, tickets, host, Arc::new(GitCli), agent)
    }

    /// Drive one ticket to a terminal outcome.
    pub async fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        let key = request.ticket_key.trim().to_uppercase();

        // Re-invocation is a no-op by default: a prior outcome returns
        // before any lock, run row, or adapter call.
        if !request.rerun {
            let k = key.clone();
            if let Some(prior) = self
                .state
                .call(move |db| db.find_idempotent_result(&k))
                .await?
            {
                tracing::info!(ticket = %key, pr_url = %prior.pr_url, "idempotent return");
                return Ok(RunOutcome::Idempotent {
                    pr_url: prior.pr_url,
                });
            }
        }

        let ticket = match self.fetch_ticket(&key).await {
            Ok(ticket) => ticket,
            Err(err) => {
                tracing::error!(ticket = %key, error = %err, "ticket fetch failed");
                return Ok(outcome_from_error(&err, None));
            }
        };

        if !ticket.is_complete() && !request.force {
            let reason = "Missing summary/description";
            self.mark_needs_human_before_run(&key, reason).await?;
            return Ok(outcome_from_error(
                &PipelineError::TicketIncomplete { key: key.clone() },
                None,
            ));
        }

        let repo_name = match resolve_repo(&ticket.fields, &self.config.workspace) {
            Ok(repo) => repo,
            Err(failure) => {
                self.mark_needs_human_before_run(&key, &failure.to_string())
                    .await?;
                return Ok(outcome_from_error(
                    &PipelineError::MappingAmbiguous {
                        key: key.clone(),
                        reason: failure.to_string(),
                    },
                    None,
                ));
            }
        };

        let repo_path = self.config.repo_path(&repo_name);
        if !repo_path.exists() {
            return Ok(outcome_from_error(
                &PipelineError::RepoMissing { path: repo_path },
                None,
            ));
        }

        // The lock is taken before any ticket mutation, so contention
        // leaves ticket state untouched. Non-blocking: busy is a result.
        let run_id = new_run_id();
        let stale_after = Duration::from_secs(self.config.state.lock_stale_after_minutes * 60);
        let acquired = {
            let (repo, rid) = (repo_name.clone(), run_id.clone());
            self.state
                .call(move |db| db.acquire_repo_lock(&repo, &rid, stale_after))
                .await?
        };
        if !acquired {
            let repo = repo_name.clone();
            let holder = self
                .state
                .call(move |db| db.get_lock(&repo))
                .await?
                .map(|lock| lock.run_id)
                .unwrap_or_default();
            tracing::warn!(ticket = %key, repo = %repo_name, holder = %holder, "repo busy");
            return Ok(RunOutcome::Busy {
                repo: repo_name,
                holder,
            });
        }

        let outcome = self
            .run_locked(request, &key, &ticket, &repo_name, &repo_path, &run_id, stale_after)
            .await;

        let (repo, rid) = (repo_name.clone(), run_id.clone());
        if let Err(e) = self
            .state
            .call(move |db| db.release_repo_lock(&repo, &rid))
            .await
        {
            tracing::error!(repo = %repo_name, error = %e, "failed to release repo lock");
        }

        if self.config.session.retention_days > 0 {
            match crate::session::prune_sessions(
                &self.config.sessions_dir(),
                self.config.session.retention_days,
            ) {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "pruned old session directories");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "session pruning failed"),
            }
        }
        outcome
    }

    async fn run_locked(
        &self,
        request: &RunRequest,
        key: &str,
        ticket: &TicketFields,
        repo_name: &str,
        repo_path: &Path,
        run_id: &str,
        stale_after: Duration,
    ) -> Result<RunOutcome> {
        let artifacts_dir = artifacts_root(key, run_id);

        // AlreadyRunning here is a contract violation, fatal to this call.
        {
            let (k, rid, repo, dir) = (
                key.to_string(),
                run_id.to_string(),
                repo_name.to_string(),
                artifacts_dir.to_string_lossy().to_string(),
            );
            self.state
                .call(move |db| db.start_run(&k, &rid, &repo, &dir, stale_after))
                .await?;
        }

        let mut recorder = match SessionRecorder::new(
            &self.config.session,
            &self.config.sessions_dir(),
            key,
            run_id,
        ) {
            Ok(recorder) => recorder,
            Err(e) => {
                tracing::warn!(error = %e, "session capture unavailable; continuing without it");
                SessionRecorder::disabled(key, run_id)
            }
        };
        recorder.snapshot_config(self.config.as_ref());
        recorder.event(
            EventKind::RunInitiated,
            json!({
                "ticket": key,
                "repo": repo_name,
                "run_id": run_id,
                "title": ticket.summary(),
                "rerun": request.rerun,
                "force": request.force,
            }),
        );
        if let Err(e) = artifacts::write_artifact_json(&artifacts_dir, "ticket.json", &ticket.fields)
        {
            tracing::warn!(error = %e, "failed to write ticket artifact");
        }

        let result = self
            .execute(request, key, ticket, repo_name, repo_path, &artifacts_dir, &mut recorder)
            .await;

        match result {
            Ok(finalized) => {
                let completion = RunCompletion {
                    branch: Some(finalized.branch.clone()),
                    pr_url: Some(finalized.pr_url.clone()),
                    agent_exit_code: finalized.agent_exit_code,
                    summary_json: Some(finalized.summary_json.clone()),
                };
                {
                    let rid = run_id.to_string();
                    self.state
                        .call(move |db| db.finish_run(&rid, RunStatus::PrOpened, &completion))
                        .await?;
                }
                {
                    let k = key.to_string();
                    let patch = TicketPatch {
                        status: Some(TicketStatus::PrOpened),
                        repo: Some(repo_name.to_string()),
                        branch: Some(finalized.branch.clone()),
                        pr_url: Some(finalized.pr_url.clone()),
                        last_run_id: Some(run_id.to_string()),
                        last_error: Some(None),
                    };
                    let force = request.rerun || request.force;
                    self.state
                        .call(move |db| db.upsert_ticket(&k, &patch, force))
                        .await?;
                }
                recorder.event(EventKind::RunSucceeded, json!({ "pr_url": finalized.pr_url }));
                if let Err(e) = recorder.finish("normal") {
                    tracing::warn!(error = %e, "failed to write session manifest");
                }
                Ok(RunOutcome::PrOpened {
                    pr_url: finalized.pr_url,
                    run_id: run_id.to_string(),
                })
            }
            Err(err) => {
                // The failure is recorded as a session event before any
                // state transition.
                recorder.event(
                    EventKind::SessionError,
                    json!({
                        "error_type": err.label(),
                        "error_message": err.to_string(),
                    }),
                );
                recorder.event(EventKind::RunFailed, json!({ "error": err.to_string() }));

                let status = err.terminal_status();
                let completion = RunCompletion {
                    summary_json: Some(
                        json!({
                            "error": err.to_string(),
                            "error_type": err.label(),
                            "suggested_action": err.suggested_action(),
                        })
                        .to_string(),
                    ),
                    ..Default::default()
                };
                {
                    let rid = run_id.to_string();
                    self.state
                        .call(move |db| db.finish_run(&rid, status, &completion))
                        .await?;
                }
                {
                    let k = key.to_string();
                    let patch = TicketPatch {
                        status: Some(status.into()),
                        repo: Some(repo_name.to_string()),
                        last_run_id: Some(run_id.to_string()),
                        last_error: Some(Some(err.to_string())),
                        ..Default::default()
                    };
                    self.state
                        .call(move |db| db.upsert_ticket(&k, &patch, false))
                        .await?;
                }
                if let Err(e) = recorder.finish("error") {
                    tracing::warn!(error = %e, "failed to write session manifest");
                }
                Ok(outcome_from_error(
                    &err,
                    Some(artifacts_dir.to_string_lossy().to_string()),
                ))
            }
        }
    }

    /// Checkpoints 4–10: everything that happens inside the lock with a
    /// run row open. Returns the PR on success, a classified error on any
    /// stop.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        request: &RunRequest,
        key: &str,
        ticket: &TicketFields,
        repo_name: &str,
        repo_path: &Path,
        artifacts_dir: &Path,
        recorder: &mut SessionRecorder,
    ) -> Result<Finalized, PipelineError> {
        let guardrails_cfg = &self.config.guardrails;
        let policy = guardrails_cfg.policy();

        let mut test_command = guardrails_cfg.test_command.clone();
        if test_command.eq_ignore_ascii_case("auto") {
            match self
                .repo
                .detect_test_command(repo_path)
                .await
                .map_err(PipelineError::Other)?
            {
                Some(detected) => test_command = detected,
                None if guardrails_cfg.require_tests => {
                    return Err(PipelineError::TestCommandUndetected {
                        repo: repo_name.to_string(),
                    });
                }
                None => test_command.clear(),
            }
        }

        if guardrails_cfg.require_clean_worktree {
            recorder.event(EventKind::WorktreeCheckStarted, json!({}));
            let (clean, status) = self
                .repo
                .ensure_clean(repo_path)
                .await
                .map_err(PipelineError::Other)?;
            artifacts::write_artifact(artifacts_dir, "pre_git_status.txt", &status)
                .map_err(PipelineError::Other)?;
            recorder.event(EventKind::WorktreeCheckFinished, json!({ "clean": clean }));
            if !clean && !request.force {
                return Err(PipelineError::WorktreeDirty {
                    repo: repo_name.to_string(),
                    status,
                });
            }
        }

        let mut base_branch = self.config.github.default_base_branch.clone();
        if base_branch.eq_ignore_ascii_case("auto") {
            base_branch = match self
                .repo
                .detect_default_branch(repo_path)
                .await
                .map_err(PipelineError::Other)?
            {
                Some(branch) => branch,
                None => {
                    tracing::warn!(repo = %repo_name, "default branch undetectable, using main");
                    "main".to_string()
                }
            };
        }

        let title = ticket.summary();
        let branch = branch_name(key, &title);
        recorder.event(
            EventKind::BranchSetupStarted,
            json!({ "base_branch": base_branch, "branch": branch }),
        );
        self.repo
            .prepare_base(repo_path, &base_branch)
            .await
            .map_err(PipelineError::Other)?;
        self.repo
            .create_branch(repo_path, &branch)
            .await
            .map_err(PipelineError::Other)?;
        recorder.event(
            EventKind::BranchSetupFinished,
            json!({ "branch": branch, "base_branch": base_branch }),
        );

        // Every command the run executes, for the denylist check.
        let mut commands: Vec<String> = vec![
            "git fetch --all".to_string(),
            format!("git checkout --force {}", base_branch),
            format!("git reset --hard origin/{}", base_branch),
            "git clean -fd".to_string(),
            format!("git checkout -B {}", branch),
        ];

        let template = if self.config.agent.prompt_template_path.is_empty() {
            None
        } else {
            Some(
                std::fs::read_to_string(&self.config.agent.prompt_template_path)
                    .context("Failed to read prompt template")
                    .map_err(PipelineError::Other)?,
            )
        };

        let agent_timeout = Duration::from_secs(self.config.agent.timeout_minutes * 60);
        let mut notes_for_agent = String::new();
        let mut fix_attempts: u32 = 0;

        let (contract, agent_exit_code) = loop {
            recorder.event(
                EventKind::AgentInvocationStarted,
                json!({ "attempt": fix_attempts + 1 }),
            );
            let vars = PromptVars {
                ticket_key: key.to_string(),
                title: title.clone(),
                description: ticket.description(),
                acceptance: ticket.acceptance_criteria(),
                repo_path: repo_path.to_string_lossy().to_string(),
                base_branch: base_branch.clone(),
                test_command: test_command.clone(),
                format_command: guardrails_cfg.format_command.clone(),
                notes_for_agent: notes_for_agent.clone(),
            };
            let prompt = build_prompt(&vars, &policy, template.as_deref());

            let invocation = self
                .agent
                .invoke(&prompt, repo_path, agent_timeout)
                .await
                .map_err(PipelineError::Other)?;
            // The raw transcript is captured unconditionally, before any
            // parsing can fail.
            artifacts::write_artifact(artifacts_dir, TRANSCRIPT_FILE, &invocation.transcript)
                .map_err(PipelineError::Other)?;
            recorder.event(
                EventKind::AgentInvocationFinished,
                json!({
                    "exit_code": invocation.exit_code,
                    "timed_out": invocation.timed_out,
                    "transcript_chars": invocation.transcript.len(),
                }),
            );
            if invocation.timed_out {
                return Err(PipelineError::AgentTimeout {
                    minutes: self.config.agent.timeout_minutes,
                });
            }

            let contract = match parse_contract(&invocation.transcript) {
                Ok(contract) => {
                    recorder.event(
                        EventKind::ContractParsed,
                        json!({
                            "decision": contract.decision.kind(),
                            "risk": contract.risk.as_str(),
                        }),
                    );
                    contract
                }
                Err(e) => {
                    recorder.event(EventKind::ContractInvalid, json!({ "error": e.to_string() }));
                    return Err(e.into());
                }
            };

            recorder.event(EventKind::GuardrailsCheckStarted, json!({}));
            let files = self
                .repo
                .changeset(repo_path)
                .await
                .map_err(PipelineError::Other)?;
            let changeset = Changeset {
                files,
                commands: commands.clone(),
            };
            let verdict = guardrails::evaluate(&changeset, &policy);
            recorder.event(
                EventKind::GuardrailsCheckFinished,
                json!({
                    "allow": verdict.is_allow(),
                    "files_changed": changeset.files.len(),
                    "lines_changed": changeset.total_lines(),
                }),
            );
            if let GuardrailVerdict::Deny { violations } = verdict {
                recorder.event(
                    EventKind::GuardrailViolation,
                    serde_json::to_value(&violations).unwrap_or_default(),
                );
                return Err(PipelineError::GuardrailViolation { violations });
            }

            if !guardrails_cfg.format_command.is_empty() {
                recorder.event(
                    EventKind::FormatStarted,
                    json!({ "command": guardrails_cfg.format_command }),
                );
                let fmt = self
                    .repo
                    .run_command(repo_path, &guardrails_cfg.format_command, COMMAND_TIMEOUT)
                    .await
                    .map_err(PipelineError::Other)?;
                commands.push(guardrails_cfg.format_command.clone());
                artifacts::write_artifact(artifacts_dir, "format_output.log", &fmt.combined())
                    .map_err(PipelineError::Other)?;
                recorder.event(
                    EventKind::FormatFinished,
                    json!({ "exit_code": fmt.exit_code }),
                );
                if fmt.timed_out {
                    return Err(PipelineError::CommandTimeout {
                        command: guardrails_cfg.format_command.clone(),
                        seconds: COMMAND_TIMEOUT.as_secs(),
                    });
                }
            }

            if guardrails_cfg.require_tests && !test_command.is_empty() {
                recorder.event(EventKind::TestsStarted, json!({ "command": test_command }));
                let test = self
                    .repo
                    .run_command(repo_path, &test_command, COMMAND_TIMEOUT)
                    .await
                    .map_err(PipelineError::Other)?;
                commands.push(test_command.clone());
                artifacts::write_artifact(artifacts_dir, "test_output.log", &test.combined())
                    .map_err(PipelineError::Other)?;
                recorder.event(
                    EventKind::TestsFinished,
                    json!({ "exit_code": test.exit_code, "passed": test.success() }),
                );
                if test.timed_out {
                    return Err(PipelineError::CommandTimeout {
                        command: test_command.clone(),
                        seconds: COMMAND_TIMEOUT.as_secs(),
                    });
                }
                if !test.success() {
                    fix_attempts += 1;
                    recorder.event(
                        EventKind::TestFixCycle,
                        json!({
                            "attempt": fix_attempts,
                            "max_attempts": guardrails_cfg.max_fix_attempts,
                        }),
                    );
                    if fix_attempts > guardrails_cfg.max_fix_attempts {
                        // Exit 126/127 means the command itself would not
                        // run: a tooling problem, not a logic gap.
                        let environment = matches!(test.exit_code, 126 | 127);
                        return Err(PipelineError::TestsFailing {
                            attempts: guardrails_cfg.max_fix_attempts,
                            environment,
                        });
                    }
                    notes_for_agent = format!(
                        "Tests failed; please fix and re-run tests.\n\nFailing output (tail):\n{}",
                        tail(&test.combined(), 4000)
                    );
                    continue;
                }
            }

            break (contract, invocation.exit_code);
        };

        // Snapshots land before the decision gate so declined runs still
        // leave a diff behind.
        let (_, post_status) = self
            .repo
            .ensure_clean(repo_path)
            .await
            .map_err(PipelineError::Other)?;
        artifacts::write_artifact(artifacts_dir, "post_git_status.txt", &post_status)
            .map_err(PipelineError::Other)?;
        let patch = self
            .repo
            .diff_patch(repo_path)
            .await
            .map_err(PipelineError::Other)?;
        artifacts::write_artifact(artifacts_dir, "diff.patch", &patch)
            .map_err(PipelineError::Other)?;
        artifacts::write_artifact_json(artifacts_dir, "commands.json", &commands)
            .map_err(PipelineError::Other)?;

        match &contract.decision {
            Decision::Proceed => {}
            Decision::NeedsHuman { blocking_reason } => {
                return Err(PipelineError::AgentDeclined {
                    kind: "needs_human".to_string(),
                    reason: blocking_reason.clone(),
                    needs_human: true,
                });
            }
            Decision::Failed { blocking_reason } => {
                return Err(PipelineError::AgentDeclined {
                    kind: "failed".to_string(),
                    reason: blocking_reason.clone(),
                    needs_human: false,
                });
            }
        }

        let pr_url = self
            .finalize_pr(
                request,
                key,
                &title,
                repo_name,
                repo_path,
                &branch,
                &base_branch,
                &contract,
                &test_command,
                recorder,
            )
            .await?;

        let summary = json!({
            "ticket": key,
            "pr_url": pr_url,
            "repo": repo_name,
            "branch": branch,
            "contract": contract,
        });
        artifacts::write_artifact_json(artifacts_dir, "summary.json", &summary)
            .map_err(PipelineError::Other)?;

        Ok(Finalized {
            pr_url,
            branch,
            agent_exit_code: Some(agent_exit_code),
            summary_json: summary.to_string(),
        })
    }

    /// Checkpoint 10: find-or-create the PR. The host-side lookups are a
    /// second idempotency guard, independent of the state store.
    #[allow(clippy::too_many_arguments)]
    async fn finalize_pr(
        &self,
        request: &RunRequest,
        key: &str,
        title: &str,
        repo_name: &str,
        repo_path: &Path,
        branch: &str,
        base_branch: &str,
        contract: &AgentContract,
        test_command: &str,
        recorder: &mut SessionRecorder,
    ) -> Result<String, PipelineError> {
        let delays = backoff_delays(
            self.config.state.retry_attempts,
            Duration::from_millis(self.config.state.retry_base_delay_ms),
        );

        recorder.event(EventKind::PrLookupStarted, json!({}));
        if self
            .repo
            .remote_branch_exists(repo_path, branch)
            .await
            .map_err(PipelineError::Other)?
        {
            let existing = retry_adapter(
                "github",
                &delays,
                || self.host.find_by_branch(repo_name, branch, repo_path),
                |attempt, message| {
                    recorder.event(
                        EventKind::RetryScheduled,
                        json!({ "service": "github", "attempt": attempt, "error": message }),
                    );
                },
            )
            .await?;
            if let Some(pr_url) = existing {
                recorder.event(
                    EventKind::ExistingPrFound,
                    json!({ "pr_url": pr_url, "source": "branch" }),
                );
                return Ok(pr_url);
            }
        }

        let existing = retry_adapter(
            "github",
            &delays,
            || self.host.find_by_key(repo_name, key, repo_path),
            |attempt, message| {
                recorder.event(
                    EventKind::RetryScheduled,
                    json!({ "service": "github", "attempt": attempt, "error": message }),
                );
            },
        )
        .await?;
        if let Some(pr_url) = existing {
            recorder.event(
                EventKind::ExistingPrFound,
                json!({ "pr_url": pr_url, "source": "ticket_key" }),
            );
            return Ok(pr_url);
        }

        recorder.event(
            EventKind::PrCreationStarted,
            json!({ "draft": self.config.github.draft_pr }),
        );
        self.repo
            .push_branch(repo_path, branch)
            .await
            .map_err(PipelineError::Other)?;

        let create = CreatePr {
            title: format!("[{}] {}", key, title),
            body: pr_body(contract, test_command),
            base: base_branch.to_string(),
            head: branch.to_string(),
            draft: self.config.github.draft_pr,
            reviewers: self.config.github.reviewers.clone(),
            labels: self.config.github.labels.clone(),
        };
        let pr_url = retry_adapter(
            "github",
            &delays,
            || self.host.create(repo_name, &create, repo_path),
            |attempt, message| {
                recorder.event(
                    EventKind::RetryScheduled,
                    json!({ "service": "github", "attempt": attempt, "error": message }),
                );
            },
        )
        .await?;
        recorder.event(EventKind::PrCreationFinished, json!({ "pr_url": pr_url }));

        if self.config.tickets.comment_on_pr && !request.no_comment {
            match self
                .tickets
                .comment(key, &format!("PR opened: {}", pr_url))
                .await
            {
                Ok(()) => recorder.event(EventKind::CommentPosted, json!({ "pr_url": pr_url })),
                Err(e) => {
                    // Comment failure never fails the run.
                    tracing::warn!(ticket = %key, error = %e, "ticket comment failed");
                    recorder.event(EventKind::CommentFailed, json!({ "error": e.to_string() }));
                }
            }
        }

        Ok(pr_url)
    }

    /// Fetch one ticket, retrying transient source failures with backoff.
    async fn fetch_ticket(&self, key: &str) -> Result<TicketFields, PipelineError> {
        let delays = backoff_delays(
            self.config.state.retry_attempts,
            Duration::from_millis(self.config.state.retry_base_delay_ms),
        );
        let found = retry_adapter(
            "ticket source",
            &delays,
            || self.tickets.get(key),
            |attempt, message| {
                tracing::warn!(ticket = %key, attempt, error = %message, "retrying ticket fetch");
            },
        )
        .await?;
        found.ok_or_else(|| PipelineError::TicketNotFound {
            key: key.to_string(),
        })
    }

    /// Pre-run NEEDS_HUMAN transitions (no run row exists yet).
    async fn mark_needs_human_before_run(&self, key: &str, reason: &str) -> Result<()> {
        let k = key.to_string();
        let patch = TicketPatch {
            status: Some(TicketStatus::NeedsHuman),
            last_error: Some(Some(reason.to_string())),
            ..Default::default()
        };
        self.state
            .call(move |db| db.upsert_ticket(&k, &patch, false))
            .await?;
        Ok(())
    }
}

/// Deterministic branch name from the ticket key and a slug of its title.
pub fn branch_name(key: &str, title: &str) -> String {
    let slug = slugify(title, 50);
    format!("prforge/{}-{}", key, slug)
        .trim_end_matches('-')
        .to_string()
}

fn pr_body(contract: &AgentContract, test_command: &str) -> String {
    let changes = if contract.changes.is_empty() {
        "- n/a".to_string()
    } else {
        contract
            .changes
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let or_na = |s: &str| {
        if s.is_empty() {
            "n/a".to_string()
        } else {
            s.to_string()
        }
    };
    [
        "## Summary".to_string(),
        or_na(&contract.summary),
        String::new(),
        "## Changes".to_string(),
        changes,
        String::new(),
        "## How to Test".to_string(),
        format!("- {}", or_na(test_command)),
        String::new(),
        "## Risk / Rollout Notes".to_string(),
        contract.risk.as_str().to_string(),
        String::new(),
        "## Notes for Reviewer".to_string(),
        or_na(&contract.notes_for_reviewer),
    ]
    .join("\n")
}

fn tail(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut cut = text.len() - max_chars;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    &text[cut..]
}

fn outcome_from_error(err: &PipelineError, artifacts_dir: Option<String>) -> RunOutcome {
    match err.terminal_status() {
        RunStatus::NeedsHuman => RunOutcome::NeedsHuman {
            reason: err.to_string(),
            artifacts_dir,
            suggested_action: err.suggested_action().to_string(),
        },
        _ => RunOutcome::Failed {
            reason: err.to_string(),
            artifacts_dir,
            suggested_action: err.suggested_action().to_string(),
        },
    }
}

/// Bounded retry for adapter calls: transient failures sleep through the
/// delay schedule, auth failures escalate immediately.
async fn retry_adapter<T, Fut>(
    service: &str,
    delays: &[Duration],
    mut op: impl FnMut() -> Fut,
    mut on_retry: impl FnMut(u32, &str),
) -> Result<T, PipelineError>
where
    Fut: std::future::Future<Output = Result<T, AdapterError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(AdapterError::Auth(message)) => {
                return Err(PipelineError::Auth {
                    service: service.to_string(),
                    message,
                });
            }
            Err(AdapterError::Transient(message)) => {
                let idx = (attempt - 1) as usize;
                if idx < delays.len() {
                    on_retry(attempt, &message);
                    tokio::time::sleep(delays[idx]).await;
                    continue;
                }
                return Err(PipelineError::Transient {
                    service: service.to_string(),
                    attempts: attempt,
                    message,
                });
            }
            Err(AdapterError::Other(e)) => return Err(PipelineError::Other(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_is_deterministic_and_slugged() {
        assert_eq!(
            branch_name("ABC-1", "Fix the Login Bug!"),
            "prforge/ABC-1-fix-the-login-bug"
        );
        assert_eq!(branch_name("ABC-2", ""), "prforge/ABC-2");
    }

    #[test]
    fn pr_body_fills_gaps_with_na() {
        let contract = AgentContract {
            decision: Decision::Proceed,
            summary: String::new(),
            changes: vec![],
            tests: Default::default(),
            risk: crate::contract::RiskLevel::Low,
            repo: String::new(),
            branch: String::new(),
            commit_message: String::new(),
            notes_for_reviewer: String::new(),
        };
        let body = pr_body(&contract, "cargo test");
        assert!(body.contains("## Summary\nn/a"));
        assert!(body.contains("- n/a"));
        assert!(body.contains("- cargo test"));
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }

    #[tokio::test]
    async fn retry_adapter_retries_transient_then_succeeds() {
        let calls = std::cell::Cell::new(0u32);
        let mut retried = 0;
        let result: Result<i32, PipelineError> = retry_adapter(
            "svc",
            &[Duration::from_millis(1), Duration::from_millis(1)],
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(AdapterError::Transient("503".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            |_, _| retried += 1,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(retried, 2);
    }

    #[tokio::test]
    async fn retry_adapter_fails_fast_on_auth() {
        let mut retried = 0;
        let result: Result<i32, PipelineError> = retry_adapter(
            "svc",
            &[Duration::from_millis(1)],
            || async { Err(AdapterError::Auth("401".into())) },
            |_, _| retried += 1,
        )
        .await;
        assert!(matches!(result, Err(PipelineError::Auth { .. })));
        assert_eq!(retried, 0);
    }

    #[tokio::test]
    async fn retry_adapter_exhausts_schedule() {
        let result: Result<i32, PipelineError> = retry_adapter(
            "svc",
            &[Duration::from_millis(1)],
            || async { Err(AdapterError::Transient("503".into())) },
            |_, _| {},
        )
        .await;
        match result {
            Err(PipelineError::Transient { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected transient exhaustion, got {:?}", other.map(|_| ())),
        }
    }
}
