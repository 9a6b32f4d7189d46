//! `prforge run <KEY>` and `prforge run-next` — the pipeline entrypoints.

use anyhow::Result;
use console::style;

use prforge::adapters::{JiraSource, TicketSource};
use prforge::pipeline::{Pipeline, RunOutcome, RunRequest};
use prforge::state::{TicketPatch, TicketStatus};

use super::{load_config_or_exit, open_state};

pub async fn run(key: &str, force: bool, rerun: bool, no_comment: bool) -> Result<i32> {
    let config = match load_config_or_exit() {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };
    let state = open_state(&config)?;
    let pipeline = Pipeline::with_defaults(config, state);

    let request = RunRequest {
        ticket_key: key.to_string(),
        force,
        rerun,
        no_comment,
    };
    let outcome = pipeline.run(&request).await?;
    Ok(report(&outcome))
}

pub async fn run_next() -> Result<i32> {
    let config = match load_config_or_exit() {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };

    let source = JiraSource::new(&config.tickets);
    let tickets = match source.search(&config.tickets.jql, 1).await {
        Ok(tickets) => tickets,
        Err(e) => {
            eprintln!("{} {}", style("Scan failed:").red().bold(), e);
            return Ok(3);
        }
    };
    let Some(next) = tickets.first() else {
        println!("{}", style("No eligible tickets").yellow());
        return Ok(0);
    };
    println!("{} {}", style("Next ticket:").bold(), next.key);

    let state = open_state(&config)?;
    // The picked ticket is enqueued before the pipeline takes over; a
    // ticket with history keeps its state.
    {
        let key = next.key.clone();
        state
            .call(move |db| {
                db.record_discovered(&key)?;
                let ticket = db.get_ticket(&key)?;
                if ticket.is_some_and(|t| t.status == TicketStatus::Discovered) {
                    let patch = TicketPatch {
                        status: Some(TicketStatus::Queued),
                        ..Default::default()
                    };
                    db.upsert_ticket(&key, &patch, false)?;
                }
                Ok(())
            })
            .await?;
    }
    let pipeline = Pipeline::with_defaults(config.clone(), state);
    let outcome = pipeline.run(&RunRequest::new(&next.key)).await?;
    Ok(report(&outcome))
}

/// Print the outcome the way operators consume it: the PR URL on stdout
/// for success paths, styled diagnostics on stderr otherwise.
fn report(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::PrOpened { pr_url, .. } | RunOutcome::Idempotent { pr_url } => {
            println!("{}", pr_url);
        }
        RunOutcome::Busy { repo, holder } => {
            eprintln!(
                "{} repo {} is locked by run {}",
                style("Busy:").yellow().bold(),
                repo,
                holder
            );
        }
        RunOutcome::NeedsHuman {
            reason,
            artifacts_dir,
            suggested_action,
        } => {
            eprintln!("{} {}", style("Needs human:").yellow().bold(), reason);
            eprintln!("  next: {}", suggested_action);
            if let Some(dir) = artifacts_dir {
                eprintln!("  artifacts: {}", dir);
            }
        }
        RunOutcome::Failed {
            reason,
            artifacts_dir,
            suggested_action,
        } => {
            eprintln!("{} {}", style("Failed:").red().bold(), reason);
            eprintln!("  next: {}", suggested_action);
            if let Some(dir) = artifacts_dir {
                eprintln!("  artifacts: {}", dir);
            }
        }
    }
    outcome.exit_code()
}
