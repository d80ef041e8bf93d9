//! cdcsync CLI
//!
//! Runs the sync engine and inspects its local state.
//!
//! # Commands
//!
//! - `run` - Bootstrap and follow the change feed until interrupted
//! - `inspect` - Display identity, snapshot and cursor of a data directory
//! - `version` - Show version information
//!
//! Every option can also be set through a `CDCSYNC_*` environment variable.

mod commands;

use clap::{Parser, Subcommand};
use commands::run::RunArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Change-data-capture sync client.
#[derive(Parser)]
#[command(name = "cdcsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the local databases
    #[arg(global = true, short, long, env = "CDCSYNC_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap and follow the change feed until interrupted
    Run(RunArgs),

    /// Display identity, snapshot and cursor of a data directory
    Inspect {
        /// Count rows in every replicated table
        #[arg(short, long)]
        tables: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run(args) => {
            commands::run::run(&cli.data_dir, args).await?;
        }
        Commands::Inspect { tables, format } => {
            commands::inspect::run(&cli.data_dir, tables, &format).await?;
        }
        Commands::Version => {
            println!("cdcsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
