//! `prforge status <KEY>` — ticket state and run history.

use anyhow::Result;
use console::style;

use super::{load_config_or_exit, open_state};

pub async fn status(key: &str, json: bool) -> Result<i32> {
    let config = match load_config_or_exit() {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };
    let state = open_state(&config)?;

    let key = key.trim().to_uppercase();
    let (ticket, runs) = {
        let k = key.clone();
        state
            .call(move |db| {
                let ticket = db.get_ticket(&k)?;
                let runs = db.list_runs(&k)?;
                Ok((ticket, runs))
            })
            .await?
    };

    let Some(ticket) = ticket else {
        println!("{}", style("No state found").yellow());
        return Ok(0);
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "ticket": ticket,
                "runs": runs,
            }))?
        );
        return Ok(0);
    }

    println!("{} {}", style("Ticket:").bold(), ticket.ticket_key);
    println!("{} {}", style("Status:").bold(), ticket.status);
    if let Some(repo) = &ticket.repo {
        println!("{} {}", style("Repo:").bold(), repo);
    }
    if let Some(branch) = &ticket.branch {
        println!("{} {}", style("Branch:").bold(), branch);
    }
    if let Some(pr_url) = &ticket.pr_url {
        println!("{} {}", style("PR:").bold(), pr_url);
    }
    if let Some(error) = &ticket.last_error {
        println!("{} {}", style("Last error:").red().bold(), error);
    }
    if !runs.is_empty() {
        println!("{}", style("Runs:").bold());
        for run in &runs {
            let finished = run.finished_at.as_deref().unwrap_or("-");
            println!(
                "  {}  {:<12} started {}  finished {}",
                run.run_id,
                run.status.as_str(),
                run.started_at,
                finished
            );
        }
    }
    Ok(0)
}
