use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shiftcal_core::ShiftRow;
use shiftcal_sync::{
    maybe_build_scheduler, ReconcileMode, SyncConfig, SyncPipeline, SyncRunSummary,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shiftcal")]
#[command(about = "Mirror open member shifts into a Google Calendar")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape and reconcile the calendar once.
    Sync {
        /// Compute and report the plan without changing the calendar.
        #[arg(long)]
        dry_run: bool,
    },
    /// Same as `sync --dry-run`.
    Plan,
    /// Scrape only and print the shifts found.
    Scrape {
        #[arg(long)]
        json: bool,
    },
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let mode = if dry_run {
                ReconcileMode::DryRun
            } else {
                ReconcileMode::Apply
            };
            let summary = SyncPipeline::new(load_config()?).run_once(mode).await?;
            print_summary(&summary);
        }
        Commands::Plan => {
            let summary = SyncPipeline::new(load_config()?)
                .run_once(ReconcileMode::DryRun)
                .await?;
            print_summary(&summary);
        }
        Commands::Scrape { json } => {
            let config = SyncConfig::scrape_only_from_env().context("loading configuration")?;
            let outcome = SyncPipeline::new(config).scrape().await?;
            let rows: Vec<ShiftRow> = outcome
                .shifts
                .records()
                .map(|record| ShiftRow::from(&record))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in &rows {
                    println!("{}  {}  ({} open)", row.start_time, row.label, row.urls.len());
                }
                println!("{} shifts from {} pages", rows.len(), outcome.pages);
            }
        }
        Commands::Schedule => {
            let mut config = load_config()?;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config));
            let mut scheduler = maybe_build_scheduler(pipeline)
                .await?
                .context("scheduler was not built")?;
            scheduler.start().await.context("starting scheduler")?;
            tracing::info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn load_config() -> Result<SyncConfig> {
    SyncConfig::from_env().context("loading configuration")
}

fn print_summary(summary: &SyncRunSummary) {
    let reconcile = &summary.reconcile;
    println!(
        "sync {}: run_id={} pages={} shifts={} added={} updated={} removed={} \
         duplicates={} unchanged={}",
        match reconcile.mode {
            ReconcileMode::Apply => "complete",
            ReconcileMode::DryRun => "planned",
        },
        summary.run_id,
        summary.pages,
        summary.shifts_parsed,
        reconcile.added,
        reconcile.updated,
        reconcile.removed,
        reconcile.duplicates_removed,
        reconcile.unchanged,
    );
}
