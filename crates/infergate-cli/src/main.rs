//! `infergate`: operator CLI for batch admission, status reconciliation and on-demand
//! dispatch.
//!
//! Configuration comes from `INFERGATE_*` environment variables; logging honours
//! `RUST_LOG` (default `info`).

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use infergate_runtime::InfergateConfig;

mod commands;
mod jsonl;

const DEFAULT_SQLITE_DB: &str = "infergate.db";

#[derive(Parser)]
#[command(name = "infergate")]
#[command(about = "Admission-controlled batch inference and rate-limited dispatch", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register input payloads as pending work units
    Enqueue {
        /// Input payload URIs
        data_uris: Vec<String>,

        /// Read URIs from a file, one per line
        #[arg(long)]
        from_file: Option<PathBuf>,
    },
    /// Show the number of work units per status
    Status,
    /// Run one admission tick
    Tick,
    /// Run admission ticks on the configured interval until Ctrl-C
    Serve,
    /// Apply one status-change notification
    Reconcile {
        /// JSON file holding the notification envelope
        #[arg(long)]
        event: PathBuf,
    },
    /// Poll the service for every in-flight job and apply what it reports
    Sync,
    /// Fan a JSONL file of records out to the invocation endpoint
    Dispatch {
        /// Input JSONL (`{"recordId", "modelInput": {"inputText"}}` per line)
        input: PathBuf,

        /// Where to write successful results (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Use bounded chunks and a fixed worker pool
        #[arg(long)]
        chunked: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = InfergateConfig::from_env(DEFAULT_SQLITE_DB)?;

    match cli.command {
        Command::Enqueue {
            data_uris,
            from_file,
        } => commands::enqueue(&config, data_uris, from_file).await,
        Command::Status => commands::status(&config).await,
        Command::Tick => commands::tick(&config).await,
        Command::Serve => commands::serve(&config).await,
        Command::Reconcile { event } => commands::reconcile(&config, &event).await,
        Command::Sync => commands::sync(&config).await,
        Command::Dispatch {
            input,
            output,
            chunked,
        } => commands::dispatch(&config, &input, output.as_deref(), chunked).await,
    }
}
