//! txmesh CLI
//!
//! Command-line tools for txmesh journal directories.
//!
//! # Commands
//!
//! - `inspect` - Summarize every journal in a directory
//! - `verify` - Check journal integrity
//! - `dump-journal` - Print journal records for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// txmesh command-line journal tools.
#[derive(Parser)]
#[command(name = "txmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize every journal in the directory
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal integrity
    Verify {
        /// Only check this resource manager's journal
        #[arg(short, long)]
        resource: Option<String>,
    },

    /// Dump journal records for debugging
    DumpJournal {
        /// Only dump this resource manager's journal
        #[arg(short, long)]
        resource: Option<String>,

        /// Only records with a transaction id above this one
        #[arg(short, long)]
        after: Option<i64>,

        /// Maximum number of records to dump per journal
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Journal directory required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify { resource } => {
            let path = cli.path.ok_or("Journal directory required for verify")?;
            commands::verify::run(&path, resource.as_deref())?;
        }
        Commands::DumpJournal {
            resource,
            after,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Journal directory required for dump-journal")?;
            commands::dump_journal::run(&path, resource.as_deref(), after, limit, &format)?;
        }
        Commands::Version => {
            println!("txmesh CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("txmesh core v{}", txmesh_core::VERSION);
            println!("txmesh protocol v{}", txmesh_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
