//! `prforge sessions` / `prforge session` — inspect captured runs.

use anyhow::Result;
use console::style;

use prforge::session::{list_sessions, read_events};

use super::load_config_or_exit;

pub async fn sessions(ticket: Option<&str>, limit: usize, json: bool) -> Result<i32> {
    let config = match load_config_or_exit() {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };

    let mut all = list_sessions(&config.sessions_dir())?;
    if let Some(ticket) = ticket {
        let ticket = ticket.trim().to_uppercase();
        all.retain(|s| s.manifest.ticket == ticket);
    }
    all.truncate(limit);

    if all.is_empty() {
        println!("{}", style("No captured sessions found").yellow());
        if !config.session.enabled {
            println!(
                "{}",
                style("Session capture is disabled; enable it with session.enabled = true").dim()
            );
        }
        return Ok(0);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(0);
    }

    println!("{}", style("Captured sessions").bold());
    for summary in &all {
        let m = &summary.manifest;
        let errors = m.errors.len();
        let errors_styled = if errors > 0 {
            style(errors.to_string()).red()
        } else {
            style(errors.to_string()).green()
        };
        println!(
            "  {}  {:<14}  {:>8.1}s  {:>3} events  {} errors",
            style(&m.ticket).bold(),
            &m.run_id[..m.run_id.len().min(14)],
            m.elapsed_s,
            m.event_count,
            errors_styled,
        );
    }
    Ok(0)
}

pub async fn session(
    ticket: &str,
    run_id: Option<&str>,
    events: bool,
    json: bool,
) -> Result<i32> {
    let config = match load_config_or_exit() {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };

    let ticket = ticket.trim().to_uppercase();
    let all = list_sessions(&config.sessions_dir())?;
    let found = all.into_iter().find(|s| {
        s.manifest.ticket == ticket
            && run_id.is_none_or(|rid| s.manifest.run_id.starts_with(rid))
    });
    let Some(summary) = found else {
        println!("{}", style("No matching session found").yellow());
        return Ok(0);
    };

    if events {
        let stream = read_events(&summary.session_path)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&stream)?);
        } else {
            for event in &stream {
                let data = if event.data.is_null() {
                    String::new()
                } else {
                    event.data.to_string()
                };
                println!(
                    "{}  {}  {}",
                    style(format!("{:>8.3}s", event.elapsed_s)).dim(),
                    style(&event.event).bold(),
                    data
                );
            }
        }
        return Ok(0);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(0);
    }

    let m = &summary.manifest;
    println!("{} {} / {}", style("Session:").bold(), m.ticket, m.run_id);
    println!("{} {}", style("Started:").bold(), m.started_at.as_deref().unwrap_or("?"));
    println!("{} {}", style("Finished:").bold(), m.finished_at.as_deref().unwrap_or("?"));
    println!("{} {:.1}s", style("Elapsed:").bold(), m.elapsed_s);
    println!("{} {}", style("Events:").bold(), m.event_count);
    if m.errors.is_empty() {
        println!("{} 0", style("Errors:").green().bold());
    } else {
        println!("{} {}", style("Errors:").red().bold(), m.errors.len());
        for error in &m.errors {
            println!("  {}", style(error.to_string()).red());
        }
    }
    println!("{} {}", style("Path:").bold(), summary.session_path.display());
    println!("{}", style("Use --events for the structured stream").dim());
    Ok(0)
}
