use clap::{Parser, Subcommand};
use console::style;

mod cmd;

#[derive(Parser)]
#[command(name = "prforge")]
#[command(version, about = "Turn approved tickets into draft pull requests with a headless coding agent")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the config file and report any errors
    ConfigValidate,
    /// Search the ticket source for eligible tickets
    Scan {
        #[arg(long, default_value = "20")]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Run the full pipeline for one ticket: branch, agent, guardrails, PR
    Run {
        key: String,
        /// Skip ticket-completeness and clean-worktree preconditions
        #[arg(long)]
        force: bool,
        /// Run again even when a prior PR exists for this ticket
        #[arg(long)]
        rerun: bool,
        /// Do not comment the PR URL back on the ticket
        #[arg(long)]
        no_comment: bool,
    },
    /// Pick the next eligible ticket and run the pipeline
    RunNext,
    /// Show the current state of a ticket and its run history
    Status {
        key: String,
        #[arg(long)]
        json: bool,
    },
    /// List captured sessions
    Sessions {
        #[arg(long)]
        ticket: Option<String>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// View one captured session (manifest by default)
    Session {
        ticket: String,
        run_id: Option<String>,
        /// Show the structured event stream
        #[arg(short, long)]
        events: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show state database contents (tickets, runs, locks)
    Db {
        table: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Clear all repo locks
    CleanLocks,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = cmd::init_tracing(cli.verbose);

    let result = match &cli.command {
        Commands::ConfigValidate => config_validate(),
        Commands::Scan { limit, json } => cmd::scan::scan(*limit, *json).await,
        Commands::Run {
            key,
            force,
            rerun,
            no_comment,
        } => cmd::run::run(key, *force, *rerun, *no_comment).await,
        Commands::RunNext => cmd::run::run_next().await,
        Commands::Status { key, json } => cmd::status::status(key, *json).await,
        Commands::Sessions {
            ticket,
            limit,
            json,
        } => cmd::session::sessions(ticket.as_deref(), *limit, *json).await,
        Commands::Session {
            ticket,
            run_id,
            events,
            json,
        } => cmd::session::session(ticket, run_id.as_deref(), *events, *json).await,
        Commands::Db { table, json } => cmd::db::db(table.as_deref(), *json).await,
        Commands::CleanLocks => cmd::db::clean_locks().await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            3
        }
    };
    std::process::exit(code);
}

fn config_validate() -> anyhow::Result<i32> {
    match cmd::load_config_or_exit() {
        Ok(_) => {
            println!("{}", style("Config valid").green());
            Ok(0)
        }
        Err(code) => Ok(code),
    }
}
