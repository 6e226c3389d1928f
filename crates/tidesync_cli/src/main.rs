//! TideSync CLI
//!
//! Offline inspection of a client's saved sync state.
//!
//! # Commands
//!
//! - `inspect` - Summarize queue, conflicts, cursors and cached records
//! - `queue` - List pending changes in push order
//! - `conflicts` - List unresolved conflicts

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TideSync client state tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the client state directory
    #[arg(global = true, short, long)]
    state: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the saved state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List pending changes in push order
    Queue {
        /// Maximum number of changes to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List unresolved conflicts
    Conflicts {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let state = cli.state.ok_or("State directory required for inspect")?;
            commands::inspect::run(&state, &format)?;
        }
        Commands::Queue { limit, format } => {
            let state = cli.state.ok_or("State directory required for queue")?;
            commands::queue::run(&state, limit, &format)?;
        }
        Commands::Conflicts { format } => {
            let state = cli.state.ok_or("State directory required for conflicts")?;
            commands::conflicts::run(&state, &format)?;
        }
        Commands::Version => {
            println!("TideSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("State format v{}", tidesync_engine::SNAPSHOT_VERSION);
        }
    }

    Ok(())
}
