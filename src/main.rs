//! matchday-pulse: binary entrypoint.
//!
//! `fetch <source>` runs one publish cycle, `scan-fixtures` one fixture scan,
//! `run` the long-lived pipeline until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use matchday_pulse::metrics::Metrics;
use matchday_pulse::telemetry::init_tracing;
use matchday_pulse::{Pipeline, PipelineConfig, RunOptions, SourceKind};

#[derive(Debug, Parser)]
#[command(name = "matchday-pulse", version, about = "Football event ingestion and priority dispatch")]
struct Cli {
    /// Pipeline TOML config (default: config/pipeline.toml when present).
    #[arg(long, global = true, env = "PIPELINE_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one publish cycle for a source and print the report.
    Fetch {
        /// rss, social or odds
        source: SourceKind,
    },
    /// Dispatcher and worker pool, plus fetchers and the fixture scan.
    Run {
        /// Skip fetchers and the fixture scan.
        #[arg(long)]
        no_ingest: bool,
    },
    /// Run one fixture scan and print the report.
    ScanFixtures,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for ctrl-c; stopping now");
    }
}

async fn real_main(cli: Cli) -> Result<()> {
    let cfg = PipelineConfig::load_default(cli.config.as_deref()).context("loading config")?;
    let pipeline = Pipeline::from_config(cfg).await?;

    match cli.command {
        Command::Fetch { source } => {
            let report = pipeline.fetch_once(source).await?;
            println!(
                "{source}: fetched={} published={} duplicates={} item_errors={}",
                report.fetched, report.published, report.duplicates, report.item_errors
            );
            if let Some(err) = report.source_error {
                anyhow::bail!("{source} poll failed: {err}");
            }
        }
        Command::ScanFixtures => {
            let report = pipeline.scan_once().await?;
            println!(
                "fixtures: fetched={} queued={} duplicates={} closed={}",
                report.fetched, report.queued, report.duplicates, report.closed
            );
            if let Some(err) = report.source_error {
                anyhow::bail!("fixture scan failed: {err}");
            }
        }
        Command::Run { no_ingest } => {
            let metrics = match Metrics::init() {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(error = ?e, "metrics recorder not installed");
                    None
                }
            };
            pipeline
                .run(RunOptions { no_ingest }, metrics, shutdown_signal())
                .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    match real_main(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "matchday-pulse failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
