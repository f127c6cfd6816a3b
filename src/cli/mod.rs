//! Command-line front end.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod helpers;
mod init;
mod run;
mod status;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "shelf")]
#[command(about = "Distributor catalog acquisition and product reconciliation")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the database and credentials
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and register configured distributors
    Init,

    /// Run one paced session per distributor
    Run {
        /// Distributor slugs to run
        slugs: Vec<String>,
        /// Run every active distributor
        #[arg(long, conflicts_with = "slugs")]
        all: bool,
        /// Distributors to run at once (overrides config)
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },

    /// Show a distributor's pacing state for a day
    Status {
        slug: String,
        /// Day to show (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// List recent runs for a distributor
    Runs {
        slug: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List provisional matches waiting for review
    Queue {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).await?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    match cli.command {
        Commands::Init => init::cmd_init(&config).await,
        Commands::Run {
            slugs,
            all,
            concurrency,
        } => run::cmd_run(&config, slugs, all, concurrency).await,
        Commands::Status { slug, date } => status::cmd_status(&config, &slug, date).await,
        Commands::Runs { slug, limit } => status::cmd_runs(&config, &slug, limit).await,
        Commands::Queue { limit } => status::cmd_queue(&config, limit).await,
    }
}
