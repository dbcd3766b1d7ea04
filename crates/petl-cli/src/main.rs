use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use petl_core::PartnerId;
use petl_operators::{maybe_build_scheduler, EtlConfig, Workflow};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "petl-cli")]
#[command(about = "Partner postings ETL command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one partner's postings for the quarter containing --date.
    Ingest {
        #[arg(long)]
        partner: PartnerId,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Recompute one partner's aggregate across all quarters.
    AggregatePartner {
        #[arg(long)]
        partner: PartnerId,
    },
    /// Recompute the global aggregate from every partner aggregate.
    AggregateGlobal,
    /// Ingest and aggregate every enabled partner.
    Run {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run the workflow on the configured cron until interrupted.
    Schedule,
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing();

    let config = EtlConfig::from_env();
    tracing::debug!(?config, "configuration loaded");
    let workflow = Workflow::from_config(config).await?;
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::Ingest { partner, date } => {
            let summary = workflow.ingest(&partner, date.unwrap_or(today)).await?;
            println!(
                "ingest complete: partner={} quarter={} postings={} batches={} cleared={}",
                summary.partner_id,
                summary.quarter,
                summary.total_postings,
                summary.batches.len(),
                summary.cleared_blobs
            );
        }
        Commands::AggregatePartner { partner } => {
            let summary = workflow.aggregate_partner(&partner).await?;
            println!(
                "partner aggregate complete: partner={} quarters={} total={}",
                summary.dataset_id,
                summary.quarters.len(),
                summary.total
            );
        }
        Commands::AggregateGlobal => {
            let summary = workflow.aggregate_global().await?;
            println!(
                "global aggregate complete: partners={} total={}",
                summary.partners.len(),
                summary.total
            );
        }
        Commands::Run { date } => {
            let summary = workflow.run(date.unwrap_or(today)).await?;
            println!(
                "workflow complete: run_id={} quarter={} partners={} total={}",
                summary.run_id,
                summary.quarter,
                summary.ingests.len(),
                summary.global.total
            );
            for ingest in &summary.ingests {
                let label = workflow
                    .registry()
                    .get(&ingest.partner_id)
                    .map(|partner| partner.label())
                    .unwrap_or_else(|| ingest.partner_id.as_str());
                println!(
                    "  {label}: postings={} batches={}",
                    ingest.total_postings,
                    ingest.batches.len()
                );
            }
        }
        Commands::Schedule => {
            let Some(mut sched) = maybe_build_scheduler(Arc::new(workflow)).await? else {
                bail!("scheduler disabled; set PETL_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
