use crate::{
    error::CliError,
    output::{StatusView, print_json, render_status},
};
use clap::Parser;
use commands::Commands;
use engine_config::Settings;
use engine_core::{journal::Journal, metrics::Metrics};
use engine_processing::publish::{
    PendingPartitions, PublishReport, PublishTables, Publisher, SqlExchange,
};
use model::{partition::PartitionKey, window::TimeWindow};
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod conn;
mod error;
mod output;

#[derive(Parser)]
#[command(name = "driftline", version, about = "Incremental replication into ClickHouse")]
struct Cli {
    #[arg(long, global = true, help = "Settings file, defaults to ~/.driftline/config.json")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Process name, overrides the settings")]
    process: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let settings = Settings::load_for(cli.config.as_deref(), cli.process.as_deref()).await?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let journal = conn::open_journal(&settings).await?;

    match cli.command {
        Commands::Ensure => {
            journal.ensure().await?;
            info!(process = %journal.process(), "Journal schema ready");
        }
        Commands::Status { json, limit } => {
            let state = journal.state().await?;
            let recent = journal.recent(limit).await?;
            let view = StatusView {
                process: journal.process().as_str(),
                state: state.as_ref(),
                recent: &recent,
            };
            if json {
                print_json(&view)?;
            } else {
                print!("{}", render_status(&view, settings.logging.display_timezone));
            }
        }
        Commands::Sanitize => {
            let policy = settings.sanitize_policy();
            let dedup = journal.derive("dedup");
            let reports = locked(&journal, || async {
                Ok(json!({
                    "ingest": journal.sanitize_stale(&policy).await,
                    "dedup": dedup.sanitize_stale(&policy).await,
                }))
            })
            .await?;
            print_json(&reports)?;
        }
        Commands::Prune { force } => {
            let outcome = journal.prune_retention(force).await?;
            print_json(&outcome)?;
        }
        Commands::Resolve { from, to, keep } => {
            let window = TimeWindow::new(from, to)?;
            let report = locked(&journal, || async {
                Ok(journal.resolve_active_conflicts(&window, keep).await?)
            })
            .await?;
            print_json(&report)?;
        }
        Commands::Publish {
            since,
            until,
            no_backfill,
        } => {
            let window = TimeWindow::new(since, until)?;
            let report = locked(&journal, || publish(&settings, &journal, window, !no_backfill)).await?;
            print_json(&report)?;
            if !report.failed.is_empty() {
                return Err(CliError::PublishFailed {
                    failed: report.failed.len(),
                });
            }
        }
    }

    Ok(())
}

/// Runs `f` under the process lock, so a command never races a running
/// replication.
async fn locked<T, F, Fut>(journal: &Journal, f: F) -> Result<T, CliError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CliError>>,
{
    journal
        .with_exclusive_lock(f)
        .await?
        .ok_or_else(|| CliError::Locked(journal.process().to_string()))
}

/// With `backfill` the partitions holding raw rows in `window` are
/// published, otherwise every day covering it.
async fn publish(
    settings: &Settings,
    journal: &Journal,
    window: TimeWindow,
    backfill: bool,
) -> Result<PublishReport, CliError> {
    let sink = conn::open_sink(settings)?;
    let columns = conn::raw_columns(settings, sink.as_ref()).await?;
    let tables = PublishTables::from_settings(settings, columns)?;
    let tz = tables.tz;
    let publisher = Publisher::new(Arc::new(SqlExchange::new(sink, tables)), Metrics::new())
        .with_progress(journal.derive("dedup"));

    let mut pending = PendingPartitions::new();
    if !backfill {
        for partition in PartitionKey::covering(&window, tz) {
            pending.add(partition, 0);
        }
    }
    let report = publisher
        .finalize(&mut pending, window.from, window.to, backfill)
        .await;
    if !report.any_replaced() {
        warn!(window = %window, "Nothing was published");
    }
    Ok(report)
}
