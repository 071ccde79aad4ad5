// ABOUTME: Entry point for the submission server
// ABOUTME: Connects to PostgreSQL, bootstraps tables and serves HTTP until Ctrl+C

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use shape_sync::utils::retry_with_backoff;
use submit_server::{router, PgInputLog};

#[derive(Parser)]
#[command(name = "submit-server")]
#[command(about = "Accepts game inputs and appends them to the authoritative log", long_about = None)]
#[command(version)]
struct Cli {
    /// PostgreSQL connection string of the source database
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    /// Address to listen on
    #[arg(long, env = "SUBMIT_LISTEN", default_value = "0.0.0.0:3112")]
    listen: SocketAddr,
    /// Allowed CORS origin (repeatable, "*" for any)
    #[arg(long = "allowed-origin", default_value = "*")]
    allowed_origins: Vec<String>,
    /// Connection attempts before giving up on the database
    #[arg(long, default_value_t = 5)]
    connect_retries: u32,
    /// Player whose inputs this server accepts
    #[arg(long, default_value_t = 0)]
    player_id: i64,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let log = retry_with_backoff(
        || PgInputLog::connect(&cli.database_url, cli.player_id),
        cli.connect_retries,
        Duration::from_secs(1),
    )
    .await?;
    log.bootstrap()
        .await
        .context("Failed to bootstrap the input tables")?;

    let app = router(Arc::new(log), &cli.allowed_origins);
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    tracing::info!("Submission server listening on {}", cli.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await
        .context("Server error")?;
    Ok(())
}
