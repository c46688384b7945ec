mod config;
mod error;
mod models;
mod pipeline;
mod policy;
mod scraper;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::models::SessionStats;
use crate::pipeline::{Orchestrator, RunOutcome};
use crate::policy::{PacingPlanner, success_rate};
use crate::scraper::ListingScraper;
use crate::storage::{DatasetStore, ProgressStore};
use crate::utils::{Clock, Shutdown, SystemClock};

#[derive(Parser)]
#[command(
    name = "listing-harvester",
    about = "Resumable, rate-aware batch harvester for paginated listings",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: config/default.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest pending batches until done or a daily limit is reached
    Run {
        /// Ignore a scheduled next-session time
        #[arg(long)]
        force: bool,
    },

    /// Show batch progress
    Status,

    /// Show dataset statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging.file)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Run { force } => {
            let _t = utils::Timer::start("Harvest session");
            let planner = PacingPlanner::new(config.pacing.clone());
            let fetcher = ListingScraper::new(&config.scraper, planner)
                .context("Failed to set up the listing fetcher")?;

            let mut orchestrator =
                Orchestrator::new(&config, fetcher, clock.clone(), Shutdown::on_ctrl_c()).force(force);
            let outcome = orchestrator
                .run()
                .await
                .context("Fetcher session could not be opened")?;

            match &outcome {
                RunOutcome::Done => info!("All batches completed"),
                RunOutcome::ResumeTomorrow { reason, resume_at } => {
                    info!("Stopped: {}. Resume at {}", reason, resume_at)
                }
                RunOutcome::Deferred { until } => {
                    println!("Next session is scheduled for {} (use --force to run now)", until);
                    return Ok(());
                }
                RunOutcome::Interrupted => warn!("Interrupted, progress saved"),
            }
            print_summary(orchestrator.stats(), &config);
        }

        Command::Status => {
            let store = ProgressStore::new(config.storage.progress_path.clone(), clock.clone());
            let state = store
                .try_load()
                .with_context(|| format!("Failed to read {:?}", store.path()))?
                .unwrap_or_else(|| models::ProgressState::new(clock.today()));
            let today = clock.today();

            println!("─────────────────────────────────");
            println!("  Harvester — Progress");
            println!("─────────────────────────────────");
            match state.next_batch(&config.batches) {
                Some(b) => println!("  Next batch     : {}", b.label),
                None => println!("  Next batch     : — (all {} done)", config.batches.len()),
            }
            println!(
                "  Pages today    : {} / {}",
                state.pages_scraped_on(today),
                config.rules.daily_page_limit
            );
            println!(
                "  Batches today  : {} / {}",
                state.batches_completed_on(today),
                config.rules.same_day_max_batches
            );
            println!("  Completed      : {}", state.completed_batches.len());
            for b in &state.completed_batches {
                println!(
                    "    {}  {} listings  {}",
                    b.label,
                    utils::fmt_number(b.listings_found as i64),
                    b.completed_at
                );
            }
            println!(
                "  Next session   : {}",
                state
                    .next_session_time
                    .map(|t| t.to_string())
                    .unwrap_or("—".into())
            );
            println!("─────────────────────────────────");
        }

        Command::Stats => print_dataset(&config)?,
    }

    Ok(())
}

fn init_logging(verbose: u8, log_file: &str) -> Result<()> {
    let filter = match verbose {
        0 => "listing_harvester=info,warn",
        1 => "listing_harvester=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let file_layer = if log_file.is_empty() {
        None
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("Failed to open log file {}", log_file))?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Arc::new(file)),
        )
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(file_layer)
        .with(filter)
        .init();
    Ok(())
}

fn print_summary(stats: &SessionStats, config: &AppConfig) {
    println!("─────────────────────────────────");
    println!("  Harvester — Session Summary");
    println!("─────────────────────────────────");
    println!("  Pages ok     : {}", stats.successful_pages);
    println!("  Pages failed : {}", stats.failed_pages);
    println!(
        "  Success rate : {:.1}%",
        success_rate(stats.successful_pages, stats.failed_pages)
    );
    println!("  Avg latency  : {:.2}s", stats.avg_response_time_secs);
    println!("  Listings     : {}", utils::fmt_number(stats.total_listings as i64));

    if let Err(e) = print_dataset(config) {
        warn!("Could not read dataset: {:#}", e);
    }
}

fn print_dataset(config: &AppConfig) -> Result<()> {
    let store = DatasetStore::new(config.storage.dataset_path.clone());
    let dataset = store
        .load()
        .with_context(|| format!("Failed to read {:?}", store.path()))?;

    println!("─────────────────────────────────");
    println!("  Dataset {:?}", store.path());
    println!("─────────────────────────────────");
    println!("  Records : {}", utils::fmt_number(dataset.len() as i64));
    println!("  Columns : {}", dataset.columns().len());
    for column in &config.report.top_columns {
        match dataset.most_common(column) {
            Some((value, n)) => println!("  Top {:<8}: {} ({})", column, value, n),
            None => println!("  Top {:<8}: —", column),
        }
    }
    println!("─────────────────────────────────");
    Ok(())
}
