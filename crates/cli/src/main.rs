use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::warn;
use vocabmirror_cli::{init_tracing, load_config, App};
use vocabmirror_core::FailureKind;
use vocabmirror_mirror::{RefreshOutcome, RefreshRequest};

#[derive(Parser)]
#[command(author, version, about = "vocabulary mirror refresh engine")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "VOCABMIRROR_CONFIG", default_value = "vocabmirror.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the bookkeeping and base tables.
    Init,
    /// Run an incremental refresh cycle, or queue one behind a running cycle.
    Refresh(RefreshArgs),
    /// Backfill open fetch failures from the bulk export channel.
    Resolve(ResolveArgs),
    /// Replace one base table from its bulk export.
    Reload {
        /// Base table name.
        table: String,
    },
    /// Print manage variables and open fetch failures.
    Status,
    /// Print the rebuild order if the given tables changed.
    Graph {
        /// Changed tables.
        #[arg(required = true)]
        tables: Vec<String>,
    },
    /// Refresh on the configured cadence until interrupted.
    Serve,
}

#[derive(Args)]
struct RefreshArgs {
    /// Lower bound of the window (RFC 3339); defaults to the last successful refresh.
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    /// Accept a --since newer than the last successful refresh.
    #[arg(long)]
    force_non_contiguity: bool,
    /// Look-back subtracted from the lower bound.
    #[arg(long)]
    buffer_hours: Option<u32>,
    /// Bulk-load every base table instead.
    #[arg(long)]
    full_reload: bool,
}

#[derive(Args)]
struct ResolveArgs {
    /// Only resolve failures of this kind (repeatable).
    #[arg(long = "kind")]
    kinds: Vec<FailureKind>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let app = App::connect(config).await?;

    match cli.command {
        Commands::Init => {
            println!("Schema ready: {}", app.managed_tables().join(", "));
        }
        Commands::Refresh(args) => {
            let request = RefreshRequest {
                since: args.since,
                force_non_contiguity: args.force_non_contiguity,
                buffer_hours: args.buffer_hours,
                full_reload: args.full_reload,
            };
            match app.refresh(request).await? {
                RefreshOutcome::Completed(report) => print_json(&report)?,
                RefreshOutcome::AlreadyRunning => {
                    println!("A refresh is already running; a follow-up cycle was requested.")
                }
            }
        }
        Commands::Resolve(args) => {
            let report = app.resolve(&args.kinds).await?;
            if !report.still_open.is_empty() {
                warn!(still_open = report.still_open.len(), "some failures remain open");
            }
            print_json(&report)?;
        }
        Commands::Reload { table } => print_json(&app.reload(&table).await?)?,
        Commands::Status => print_json(&app.status().await?)?,
        Commands::Graph { tables } => print_json(&app.graph(&tables)?)?,
        Commands::Serve => {
            app.serve(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "unable to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            })
            .await;
        }
    }
    Ok(())
}
