mod app;
mod cache;
mod catalog;
mod model;
mod output;
mod registry;
mod runtime;
mod scheduler;
mod secrets;
mod sources;
mod transform;

use clap::{Parser, Subcommand};
use collector_core::{telemetry, Config};
use model::{Outcome, RunResult};
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "collector")]
#[clap(about = "Pluggable SaaS audit log collector", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Daemon,

    /// Run every enabled instance once and exit; non-zero exit status if
    /// any instance failed permanently
    Once,

    /// Perform a single scheduling pass, for cron or serverless drivers
    Tick,

    /// Validate configuration, catalog and secrets without collecting
    Check,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Fatal error");
            process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    // Load configuration
    let config = Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // Initialize telemetry
    telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();
    let app = app::App::new(config).await?;

    let code = match cli.command {
        Commands::Daemon => {
            app.run_daemon().await?;
            0
        }

        Commands::Once => {
            let results = app.run_once().await?;
            summarize(&results);
            if results
                .iter()
                .any(|result| result.outcome == Outcome::PermanentFailure)
            {
                1
            } else {
                0
            }
        }

        Commands::Tick => {
            let results = app.run_tick().await?;
            summarize(&results);
            0
        }

        Commands::Check => {
            app.check().await?;
            info!("Configuration OK");
            0
        }
    };

    telemetry::shutdown();
    Ok(code)
}

fn summarize(results: &[RunResult]) {
    let collected: usize = results.iter().map(|result| result.records).sum();
    let failed = results
        .iter()
        .filter(|result| result.outcome != Outcome::Success)
        .count();

    info!(
        instances = results.len(),
        records = collected,
        failed,
        "Collection pass finished"
    );
}
