//! `prforge db` and `prforge clean-locks` — state database inspection.

use anyhow::Result;
use console::style;

use super::{load_config_or_exit, open_state};

const TABLES: &[&str] = &["tickets", "runs", "locks"];

pub async fn db(table: Option<&str>, json: bool) -> Result<i32> {
    let config = match load_config_or_exit() {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };
    let state = open_state(&config)?;

    let tables: Vec<String> = match table {
        Some(t) if TABLES.contains(&t) => vec![t.to_string()],
        Some(t) => {
            eprintln!(
                "{} {} (choose from {})",
                style("Unknown table:").red().bold(),
                t,
                TABLES.join(", ")
            );
            return Ok(1);
        }
        None => TABLES.iter().map(|s| s.to_string()).collect(),
    };

    let mut dump = serde_json::Map::new();
    for table in &tables {
        let value = match table.as_str() {
            "tickets" => {
                let tickets = state.call(|db| db.list_tickets()).await?;
                serde_json::to_value(tickets)?
            }
            "runs" => {
                let runs = state
                    .call(|db| {
                        let mut all = Vec::new();
                        for ticket in db.list_tickets()? {
                            all.extend(db.list_runs(&ticket.ticket_key)?);
                        }
                        Ok(all)
                    })
                    .await?;
                serde_json::to_value(runs)?
            }
            _ => {
                let locks = state.call(|db| db.list_locks()).await?;
                serde_json::to_value(locks)?
            }
        };
        dump.insert(table.clone(), value);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&dump)?);
        return Ok(0);
    }

    let mut empty = true;
    for table in &tables {
        let rows = dump
            .get(table)
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        println!("{} ({})", style(table).bold(), rows.len());
        for row in &rows {
            println!("  {}", row);
            empty = false;
        }
        println!();
    }
    if empty {
        println!("{}", style("All tables are empty.").dim());
    }
    Ok(0)
}

pub async fn clean_locks() -> Result<i32> {
    let config = match load_config_or_exit() {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };
    let state = open_state(&config)?;
    let removed = state.call(|db| db.clear_all_locks()).await?;
    if removed > 0 {
        println!("{}", style(format!("Cleared {} lock(s)", removed)).green());
    } else {
        println!("{}", style("No locks to clear").dim());
    }
    Ok(0)
}
