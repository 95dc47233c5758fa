//! Sluice CLI
//!
//! Operator tools for broker journals and paging directories.
//!
//! # Commands
//!
//! - `dump` - Print every record of a journal
//! - `count` - Count records per kind and per user type
//! - `verify` - Check every segment for damage
//! - `compact` - Run one compaction pass
//! - `paging-status` - Show the paging state of every address

mod commands;

use clap::{Parser, Subcommand};
use commands::JournalArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Sluice journal and paging tools.
#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal or paging directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Segment file prefix
    #[arg(global = true, long, default_value = "sluice")]
    prefix: String,

    /// Segment file extension
    #[arg(global = true, long, default_value = "jrn")]
    extension: String,

    /// Segment size in bytes
    #[arg(global = true, long, default_value_t = 10 * 1024 * 1024)]
    segment_size: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record of a journal, live or not
    Dump {
        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Count records per kind and per user type
    Count {
        /// Load the journal and count only live records
        #[arg(long)]
        live: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every segment for damage
    Verify,

    /// Run one compaction pass
    Compact {
        /// Show segment occupancy without compacting
        #[arg(short, long)]
        dry_run: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the paging state of every address
    PagingStatus {
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
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let journal = JournalArgs {
        prefix: cli.prefix,
        extension: cli.extension,
        segment_size: cli.segment_size,
    };

    match cli.command {
        Commands::Dump { limit, format } => {
            let path = cli.path.ok_or("Journal path required for dump")?;
            commands::dump::run(&path, &journal, limit, &format)?;
        }
        Commands::Count { live, format } => {
            let path = cli.path.ok_or("Journal path required for count")?;
            commands::count::run(&path, &journal, live, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Journal path required for verify")?;
            commands::verify::run(&path, &journal)?;
        }
        Commands::Compact { dry_run, format } => {
            let path = cli.path.ok_or("Journal path required for compact")?;
            commands::compact::run(&path, &journal, dry_run, &format)?;
        }
        Commands::PagingStatus { format } => {
            let path = cli.path.ok_or("Paging path required for paging-status")?;
            commands::paging_status::run(&path, &format)?;
        }
        Commands::Version => {
            println!("Sluice CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
