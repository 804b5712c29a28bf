//! Tagmaker - Tag Graph Maintenance Engine
//!
//! Command-line entry point: runs edge learning and tier rebalancing once,
//! serves both on their schedules, and ingests pack feedback.

mod cli;

use clap::{Parser, Subcommand};
use cli::record_event::RecordEventArgs;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "tagmaker")]
#[command(about = "Tag co-occurrence learning and hot/warm/cold tiering", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Database path (overrides TAGMAKER_DB_PATH env var and default)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Job configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one edge learning pass
    Learn {
        /// Only this organization (replay)
        #[arg(long)]
        org: Option<String>,

        /// Lookback window in hours
        #[arg(long)]
        hours: Option<u32>,
    },

    /// Rebalance the tier of every tag
    Rebalance,

    /// Run both jobs on their schedules until Ctrl-C
    Serve,

    /// Record pack acceptance feedback
    RecordEvent {
        /// Organization ID
        #[arg(long)]
        org: String,

        /// Project ID
        #[arg(long)]
        project: String,

        /// Tags of the pack (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        tags: Vec<String>,

        /// The pack was rejected (default: accepted)
        #[arg(long)]
        rejected: bool,

        /// Memory IDs contained in the pack (comma-separated)
        #[arg(long, value_delimiter = ',')]
        items: Vec<String>,

        /// Event time as Unix seconds (default: now)
        #[arg(long)]
        ts: Option<i64>,
    },

    /// Show tag statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Use the requested level for our crates, WARN for libsql internals
    let filter = EnvFilter::new(format!(
        "tagmaker={level},tagmaker_core={level},libsql=warn",
        level = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Tagmaker v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Learn { org, hours } => {
            cli::learn::handle(org, hours, cli.db_path, config_path).await
        }
        Commands::Rebalance => cli::rebalance::handle(cli.db_path, config_path).await,
        Commands::Serve => cli::serve::handle(cli.db_path, config_path).await,
        Commands::RecordEvent {
            org,
            project,
            tags,
            rejected,
            items,
            ts,
        } => {
            let args = RecordEventArgs {
                org,
                project,
                tags,
                rejected,
                items,
                ts,
            };
            cli::record_event::handle(args, cli.db_path).await
        }
        Commands::Stats => cli::stats::handle(cli.db_path).await,
    }
}
