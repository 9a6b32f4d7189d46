//! SQLite-backed state store.
//!
//! One database file holds three tables: `tickets`, `runs`, and
//! `repo_locks`. Every transition is a single transaction, so concurrent
//! CLI invocations (separate OS processes) observe a linear history.
//! Repo-lock acquisition is a compare-and-set over the `repo` primary
//! key: `INSERT OR IGNORE` either lands or it doesn't.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::{
    PriorOutcome, RepoLock, Run, RunCompletion, RunStatus, Ticket, TicketPatch, TicketStatus,
};
use crate::errors::StateError;

/// Async-safe handle to the state database.
///
/// Wraps `StateDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous
/// SQLite I/O from tying up async worker threads.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<std::sync::Mutex<StateDb>>,
}

impl StateHandle {
    pub fn new(db: StateDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StateDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StateError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .context("State DB task panicked")?
    }

    /// Synchronous access for startup, CLI display paths, and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StateDb>> {
        self.inner
            .lock()
            .map_err(|_| StateError::LockPoisoned.into())
    }
}

pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open (or create) the state database at the given path and run
    /// migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open state database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL lets a second invocation read while a run holds the writer;
        // the busy timeout covers brief write contention between processes.
        self.conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .context("Failed to set connection pragmas")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tickets (
                    ticket_key TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    repo TEXT,
                    branch TEXT,
                    pr_url TEXT,
                    last_run_id TEXT,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    last_error TEXT
                );

                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    ticket_key TEXT NOT NULL,
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    finished_at TEXT,
                    status TEXT NOT NULL DEFAULT 'RUNNING',
                    repo TEXT,
                    branch TEXT,
                    pr_url TEXT,
                    agent_exit_code INTEGER,
                    artifacts_dir TEXT,
                    summary_json TEXT
                );

                CREATE TABLE IF NOT EXISTS repo_locks (
                    repo TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    locked_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_runs_ticket ON runs(ticket_key);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── tickets ──────────────────────────────────────────────────────

    pub fn get_ticket(&self, key: &str) -> Result<Option<Ticket>> {
        let ticket = self
            .conn
            .query_row(
                "SELECT ticket_key, status, repo, branch, pr_url, last_run_id, updated_at, last_error
                 FROM tickets WHERE ticket_key = ?1",
                params![key],
                ticket_from_row,
            )
            .optional()
            .context("Failed to read ticket")?;
        Ok(ticket)
    }

    /// Merge `patch` into the ticket row, creating it if absent.
    ///
    /// Unless `force` is set, an existing `pr_url` is never overwritten or
    /// cleared, and a `DONE` status is never downgraded.
    pub fn upsert_ticket(&mut self, key: &str, patch: &TicketPatch, force: bool) -> Result<Ticket> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT ticket_key, status, repo, branch, pr_url, last_run_id, updated_at, last_error
                 FROM tickets WHERE ticket_key = ?1",
                params![key],
                ticket_from_row,
            )
            .optional()?;

        let mut merged = existing.clone().unwrap_or(Ticket {
            ticket_key: key.to_string(),
            status: TicketStatus::Discovered,
            repo: None,
            branch: None,
            pr_url: None,
            last_run_id: None,
            updated_at: None,
            last_error: None,
        });

        if let Some(status) = patch.status {
            merged.status = status;
        }
        if let Some(repo) = &patch.repo {
            merged.repo = Some(repo.clone());
        }
        if let Some(branch) = &patch.branch {
            merged.branch = Some(branch.clone());
        }
        if let Some(pr_url) = &patch.pr_url {
            merged.pr_url = Some(pr_url.clone());
        }
        if let Some(run_id) = &patch.last_run_id {
            merged.last_run_id = Some(run_id.clone());
        }
        if let Some(last_error) = &patch.last_error {
            merged.last_error = last_error.clone();
        }

        if !force && let Some(prior) = &existing {
            if prior.status == TicketStatus::Done {
                merged.status = TicketStatus::Done;
            }
            if let Some(prior_url) = &prior.pr_url {
                merged.pr_url = Some(prior_url.clone());
            }
        }

        tx.execute(
            "INSERT INTO tickets (ticket_key, status, repo, branch, pr_url, last_run_id, updated_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'), ?7)
             ON CONFLICT(ticket_key) DO UPDATE SET
                 status = excluded.status,
                 repo = excluded.repo,
                 branch = excluded.branch,
                 pr_url = excluded.pr_url,
                 last_run_id = excluded.last_run_id,
                 updated_at = datetime('now'),
                 last_error = excluded.last_error",
            params![
                merged.ticket_key,
                merged.status.as_str(),
                merged.repo,
                merged.branch,
                merged.pr_url,
                merged.last_run_id,
                merged.last_error,
            ],
        )?;
        tx.commit()?;
        Ok(merged)
    }

    /// Record a ticket seen by `scan`. Creates the row as `DISCOVERED`;
    /// a ticket that already has history is left exactly as it is.
    pub fn record_discovered(&mut self, key: &str) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO tickets (ticket_key, status) VALUES (?1, 'DISCOVERED')
             ON CONFLICT(ticket_key) DO NOTHING",
            params![key],
        )?;
        Ok(inserted == 1)
    }

    /// A previously achieved outcome for this ticket, if any. Lets the
    /// orchestrator short-circuit without side effects.
    pub fn find_idempotent_result(&self, key: &str) -> Result<Option<PriorOutcome>> {
        let Some(ticket) = self.get_ticket(key)? else {
            return Ok(None);
        };
        match (ticket.status, &ticket.pr_url) {
            (TicketStatus::PrOpened | TicketStatus::Done, Some(pr_url)) => Ok(Some(PriorOutcome {
                ticket_key: ticket.ticket_key.clone(),
                status: ticket.status,
                pr_url: pr_url.clone(),
                branch: ticket.branch.clone(),
            })),
            _ => Ok(None),
        }
    }

    // ── runs ─────────────────────────────────────────────────────────

    /// Start a new run for `key`.
    ///
    /// The caller supplies the run id because the repo lock — acquired
    /// before any ticket mutation so a busy repo leaves ticket state
    /// untouched — is keyed by it. Fails with `AlreadyRunning` when the
    /// ticket is in flight and its last run still holds a live lock.
    pub fn start_run(
        &mut self,
        key: &str,
        run_id: &str,
        repo: &str,
        artifacts_dir: &str,
        lock_stale_after: Duration,
    ) -> Result<Run> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT ticket_key, status, repo, branch, pr_url, last_run_id, updated_at, last_error
                 FROM tickets WHERE ticket_key = ?1",
                params![key],
                ticket_from_row,
            )
            .optional()?;

        if let Some(ticket) = &existing
            && ticket.status.is_in_flight()
            && let Some(last_run_id) = &ticket.last_run_id
            && last_run_id.as_str() != run_id
        {
            let live: bool = tx.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM repo_locks l
                     WHERE l.run_id = ?1
                       AND l.locked_at > datetime('now', ?2)
                       AND NOT EXISTS(
                           SELECT 1 FROM runs r
                           WHERE r.run_id = l.run_id AND r.finished_at IS NOT NULL
                       )
                 )",
                params![last_run_id, stale_modifier(lock_stale_after)],
                |row| row.get(0),
            )?;
            if live {
                return Err(StateError::AlreadyRunning {
                    ticket_key: key.to_string(),
                    run_id: last_run_id.clone(),
                }
                .into());
            }
        }

        tx.execute(
            "INSERT INTO runs (run_id, ticket_key, status, repo, artifacts_dir)
             VALUES (?1, ?2, 'RUNNING', ?3, ?4)",
            params![run_id, key, repo, artifacts_dir],
        )?;
        tx.execute(
            "INSERT INTO tickets (ticket_key, status, repo, last_run_id, updated_at)
             VALUES (?1, 'RUNNING', ?2, ?3, datetime('now'))
             ON CONFLICT(ticket_key) DO UPDATE SET
                 status = 'RUNNING',
                 repo = excluded.repo,
                 last_run_id = excluded.last_run_id,
                 updated_at = datetime('now'),
                 last_error = NULL",
            params![key, repo, run_id],
        )?;
        tx.commit()?;

        self.get_run(run_id)?
            .ok_or_else(|| anyhow::anyhow!("run {} vanished after insert", run_id))
    }

    /// Write the run's terminal fields exactly once.
    pub fn finish_run(
        &mut self,
        run_id: &str,
        status: RunStatus,
        completion: &RunCompletion,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE runs SET
                 finished_at = datetime('now'),
                 status = ?2,
                 branch = COALESCE(?3, branch),
                 pr_url = COALESCE(?4, pr_url),
                 agent_exit_code = COALESCE(?5, agent_exit_code),
                 summary_json = COALESCE(?6, summary_json)
             WHERE run_id = ?1 AND finished_at IS NULL",
            params![
                run_id,
                status.as_str(),
                completion.branch,
                completion.pr_url,
                completion.agent_exit_code,
                completion.summary_json,
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM runs WHERE run_id = ?1)",
            params![run_id],
            |row| row.get(0),
        )?;
        if exists {
            Err(StateError::AlreadyFinished {
                run_id: run_id.to_string(),
            }
            .into())
        } else {
            Err(StateError::RunNotFound {
                run_id: run_id.to_string(),
            }
            .into())
        }
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let run = self
            .conn
            .query_row(
                "SELECT run_id, ticket_key, started_at, finished_at, status, repo, branch,
                        pr_url, agent_exit_code, artifacts_dir, summary_json
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()
            .context("Failed to read run")?;
        Ok(run)
    }

    pub fn list_runs(&self, ticket_key: &str) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, ticket_key, started_at, finished_at, status, repo, branch,
                    pr_url, agent_exit_code, artifacts_dir, summary_json
             FROM runs WHERE ticket_key = ?1 ORDER BY run_id",
        )?;
        let runs = stmt
            .query_map(params![ticket_key], run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn count_runs(&self, ticket_key: &str) -> Result<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE ticket_key = ?1",
            params![ticket_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── repo locks ───────────────────────────────────────────────────

    /// Try to take the repository lock for `run_id`.
    ///
    /// Dead holders (finished runs) and stale holders (older than
    /// `stale_after`) are reclaimed first; then a single `INSERT OR
    /// IGNORE` decides the winner. Returns `false` on contention — busy
    /// is a result, not an error.
    pub fn acquire_repo_lock(
        &mut self,
        repo: &str,
        run_id: &str,
        stale_after: Duration,
    ) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM repo_locks
             WHERE repo = ?1
               AND (locked_at <= datetime('now', ?2)
                    OR run_id IN (SELECT run_id FROM runs WHERE finished_at IS NOT NULL))",
            params![repo, stale_modifier(stale_after)],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO repo_locks (repo, run_id) VALUES (?1, ?2)",
            params![repo, run_id],
        )?;
        let acquired = if inserted == 1 {
            true
        } else {
            // Re-entrant acquisition by the same run is not contention.
            let holder: Option<String> = tx
                .query_row(
                    "SELECT run_id FROM repo_locks WHERE repo = ?1",
                    params![repo],
                    |row| row.get(0),
                )
                .optional()?;
            holder.as_deref() == Some(run_id)
        };
        tx.commit()?;
        Ok(acquired)
    }

    /// Release the lock if held by `run_id`; otherwise a no-op.
    pub fn release_repo_lock(&mut self, repo: &str, run_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM repo_locks WHERE repo = ?1 AND run_id = ?2",
            params![repo, run_id],
        )?;
        Ok(())
    }

    pub fn get_lock(&self, repo: &str) -> Result<Option<RepoLock>> {
        let lock = self
            .conn
            .query_row(
                "SELECT repo, run_id, locked_at FROM repo_locks WHERE repo = ?1",
                params![repo],
                |row| {
                    Ok(RepoLock {
                        repo: row.get(0)?,
                        run_id: row.get(1)?,
                        locked_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to read lock")?;
        Ok(lock)
    }

    /// Delete every lock row. Returns the count removed.
    pub fn clear_all_locks(&mut self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM repo_locks", [])?;
        Ok(removed)
    }

    // ── display helpers for the CLI ──────────────────────────────────

    pub fn list_tickets(&self) -> Result<Vec<Ticket>> {
        let mut stmt = self.conn.prepare(
            "SELECT ticket_key, status, repo, branch, pr_url, last_run_id, updated_at, last_error
             FROM tickets ORDER BY ticket_key",
        )?;
        let tickets = stmt
            .query_map([], ticket_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tickets)
    }

    pub fn list_locks(&self) -> Result<Vec<RepoLock>> {
        let mut stmt =
            self.conn.prepare("SELECT repo, run_id, locked_at FROM repo_locks ORDER BY repo")?;
        let locks = stmt
            .query_map([], |row| {
                Ok(RepoLock {
                    repo: row.get(0)?,
                    run_id: row.get(1)?,
                    locked_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(locks)
    }
}

/// SQLite datetime modifier for "now minus stale_after".
fn stale_modifier(stale_after: Duration) -> String {
    format!("-{} seconds", stale_after.as_secs())
}

fn parse_status<T: std::str::FromStr<Err = String>>(
    idx: usize,
    raw: String,
) -> std::result::Result<T, rusqlite::Error> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn ticket_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<Ticket, rusqlite::Error> {
    Ok(Ticket {
        ticket_key: row.get(0)?,
        status: parse_status(1, row.get::<_, String>(1)?)?,
        repo: row.get(2)?,
        branch: row.get(3)?,
        pr_url: row.get(4)?,
        last_run_id: row.get(5)?,
        updated_at: row.get(6)?,
        last_error: row.get(7)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<Run, rusqlite::Error> {
    Ok(Run {
        run_id: row.get(0)?,
        ticket_key: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: parse_status(4, row.get::<_, String>(4)?)?,
        repo: row.get(5)?,
        branch: row.get(6)?,
        pr_url: row.get(7)?,
        agent_exit_code: row.get(8)?,
        artifacts_dir: row.get(9)?,
        summary_json: row.get(10)?,
    })
}
