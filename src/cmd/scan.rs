//! `prforge scan` — list eligible tickets from the configured query.

use anyhow::Result;
use console::style;

use prforge::adapters::{JiraSource, TicketSource};

use super::{load_config_or_exit, open_state};

pub async fn scan(limit: u32, json: bool) -> Result<i32> {
    let config = match load_config_or_exit() {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };

    let source = JiraSource::new(&config.tickets);
    let tickets = match source.search(&config.tickets.jql, limit).await {
        Ok(tickets) => tickets,
        Err(e) => {
            eprintln!("{} {}", style("Scan failed:").red().bold(), e);
            return Ok(3);
        }
    };

    // First sight of a ticket creates its row; existing history is
    // untouched.
    let state = open_state(&config)?;
    for ticket in &tickets {
        let key = ticket.key.clone();
        state
            .call(move |db| db.record_discovered(&key))
            .await?;
    }

    if json {
        let rows: Vec<_> = tickets
            .iter()
            .map(|t| serde_json::json!({ "key": t.key, "summary": t.summary() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }

    if tickets.is_empty() {
        println!("{}", style("No eligible tickets").yellow());
        return Ok(0);
    }
    println!("{}", style("Eligible tickets").bold());
    for ticket in &tickets {
        println!("  {}  {}", style(&ticket.key).green(), ticket.summary());
    }
    Ok(0)
}
