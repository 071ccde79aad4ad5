// ABOUTME: CLI entry point for shape-sync
// ABOUTME: Parses commands, builds the configuration and routes to handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use shape_sync::commands;
use shape_sync::SyncConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shape-sync")]
#[command(about = "Local-first sync client for change-log shapes", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (defaults are used when omitted)
    #[arg(long, env = "SHAPE_SYNC_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Local SQLite database path (overrides database_path)
    #[arg(long, env = "SHAPE_SYNC_DATABASE", global = true)]
    database: Option<PathBuf>,
    /// Change-log shape endpoint (overrides shape_url)
    #[arg(long = "shape-url", env = "SHAPE_SYNC_SHAPE_URL", global = true)]
    shape_url: Option<String>,
    /// Submission endpoint (overrides submit_url)
    #[arg(long = "submit-url", env = "SHAPE_SYNC_SUBMIT_URL", global = true)]
    submit_url: Option<String>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local schema, outbox and rollback ledger
    Init,
    /// Sync watched shapes into the local store
    Sync {
        /// Stop once every shape has caught up instead of running continuously
        #[arg(long)]
        once: bool,
        /// Upper bound on cycles for --once
        #[arg(long, default_value_t = 100)]
        max_cycles: usize,
    },
    /// Apply an input locally (e.g. "health:80|xp:5") and queue it for submission
    Stage {
        input: String,
    },
    /// Submit queued inputs to the submission endpoint
    Submit,
    /// Discard unconfirmed local writes and the queued inputs
    Discard,
    /// Print the rows of a local table
    Show {
        table: String,
    },
    /// List queued inputs and unconfirmed local events
    Pending,
}

impl Cli {
    fn resolve_config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = SyncConfig::load_or_default(self.config.as_deref())?;
        if let Some(database) = &self.database {
            config.database_path = database.clone();
        }
        if let Some(url) = &self.shape_url {
            config.shape_url = url.clone();
        }
        if let Some(url) = &self.submit_url {
            config.submit_url = url.clone();
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG has precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.resolve_config()?;

    match cli.command {
        Commands::Init => commands::init(&config).await,
        Commands::Sync { once, max_cycles } => commands::sync(&config, once, max_cycles).await,
        Commands::Stage { input } => commands::stage(&config, &input).await,
        Commands::Submit => commands::submit(&config).await,
        Commands::Discard => commands::discard(&config).await,
        Commands::Show { table } => commands::show(&config, &table).await,
        Commands::Pending => commands::pending(&config).await,
    }
}
