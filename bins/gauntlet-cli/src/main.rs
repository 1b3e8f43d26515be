mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gauntlet_common::Config;

#[derive(Parser)]
#[command(name = "gauntlet-cli")]
#[command(about = "Gauntlet CLI - Run evaluations and manage the reference dataset cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one submission synchronously and print the finished job
    Run {
        /// Object-store key of the submission archive
        #[arg(short = 'k', long)]
        submission_key: String,

        /// Display name used in the result key
        #[arg(short, long, default_value = "Unknown")]
        name: String,

        /// Run the abbreviated evaluation
        #[arg(short, long)]
        quick: bool,

        /// Caller-side submission id echoed in the result
        #[arg(long)]
        submission_id: Option<i64>,
    },

    /// Download and extract the reference dataset if it is not cached yet
    WarmCache,

    /// Show whether the reference dataset cache is valid
    CacheStatus {
        /// Print the integrity marker as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Run {
            submission_key,
            name,
            quick,
            submission_id,
        } => {
            commands::run_evaluation(&config, &submission_key, &name, quick, submission_id).await?;
        }
        Commands::WarmCache => {
            commands::warm_cache(&config).await?;
        }
        Commands::CacheStatus { json } => {
            commands::cache_status(&config, json).await?;
        }
    }

    Ok(())
}
