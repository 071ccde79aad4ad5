// ABOUTME: Sync command - runs the orchestrator against the change-log service
// ABOUTME: Either until caught up (--once) or continuously until Ctrl+C

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{install_rollback, open_store};
use crate::config::SyncConfig;
use crate::orchestrator::{LoggingObserver, SyncOrchestrator};

/// Run the sync loop.
///
/// With `once`, cycles until every shape is caught up (at most `max_cycles`)
/// and exits non-zero if the last cycle still had errors.
pub async fn sync(config: &SyncConfig, once: bool, max_cycles: usize) -> Result<()> {
    let store = open_store(config)?;
    let rollback = install_rollback(config, &store)?;
    let observer = Arc::new(LoggingObserver::new(store.clone(), config.watched_tables()));
    let mut orchestrator = SyncOrchestrator::new(config, store, Some(rollback))
        .context("Failed to set up sync")?
        .with_observer(observer);

    tracing::info!("Syncing from {}", config.shape_url);

    if once {
        let stats = orchestrator.run_until_caught_up(max_cycles).await;
        println!(
            "Materialized {} transaction(s) from {} event(s) in {}ms",
            stats.transactions_materialized, stats.events_received, stats.duration_ms
        );
        if stats.rolled_back > 0 {
            println!("Rolled back {} unconfirmed local event(s)", stats.rolled_back);
        }
        if !orchestrator.is_caught_up() {
            anyhow::bail!(
                "Sync did not catch up after {} cycle(s) ({} poll error(s))",
                max_cycles,
                stats.poll_errors
            );
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, shutting down");
                let _ = shutdown_tx.send(());
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    orchestrator
        .run(shutdown_rx)
        .await
        .context("Sync loop failed")?;
    Ok(())
}
