mod cli;

use anyhow::Result;
use cairn::config::CairnConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cairn", version, about = "Embedded knowledge store for AI-assistant memory")]
struct Cli {
    /// Config file (defaults to ~/.cairn/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background worker until interrupted
    Serve,
    /// Store one event read as JSON from stdin
    Capture,
    /// Search observations (or the tool registry) in a partition
    Search {
        query: String,
        #[arg(short, long)]
        partition: String,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Search the tool registry instead of observations
        #[arg(long)]
        tools: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show store statistics
    Stats {
        #[arg(short, long)]
        partition: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run integrity and schema diagnostics
    Doctor,
    /// Open or close a session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Rebuild the full-text indexes from their content tables
    RebuildIndex,
    /// Flush the write-ahead log into the main database file
    Checkpoint,
    /// Permanently remove observations soft-deleted before the cutoff
    Purge {
        #[arg(long, default_value_t = 30)]
        older_than_days: u64,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a session and print its id
    Start {
        #[arg(short, long)]
        partition: String,
    },
    /// End a session
    End {
        id: String,
        #[arg(long)]
        summary: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CairnConfig::load_from(path)?,
        None => CairnConfig::load()?,
    };

    // Log to stderr so stdout stays clean for command output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => cli::serve::serve(config).await?,
        Command::Capture => cli::capture::capture_stdin(&config)?,
        Command::Search {
            query,
            partition,
            limit,
            tools,
            json,
        } => {
            let args = cli::search::SearchArgs {
                query: &query,
                partition: &partition,
                limit,
                tools,
                json,
            };
            cli::search::search(&config, &args)?
        }
        Command::Stats { partition, json } => cli::stats::stats(&config, partition.as_deref(), json)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Session { action } => match action {
            SessionAction::Start { partition } => cli::session::start(&config, &partition)?,
            SessionAction::End { id, summary } => cli::session::end(&config, &id, summary.as_deref())?,
        },
        Command::RebuildIndex => cli::maintenance::rebuild_index(&config)?,
        Command::Checkpoint => cli::maintenance::checkpoint(&config)?,
        Command::Purge { older_than_days } => cli::maintenance::purge(&config, older_than_days)?,
    }

    Ok(())
}
