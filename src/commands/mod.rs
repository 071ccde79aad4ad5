// ABOUTME: Command implementations for the shape-sync CLI
// ABOUTME: Exports init, sync, stage, submit, discard, show and pending

pub mod local;
pub mod sync;

pub use local::{discard, init, pending, show, stage, submit};
pub use sync::sync;

use anyhow::{Context, Result};

use crate::config::SyncConfig;
use crate::rollback::{RollbackHandle, RollbackManager};
use crate::store::LocalStore;

/// Open the configured local store, creating the file if needed.
pub fn open_store(config: &SyncConfig) -> Result<LocalStore> {
    let path = config.resolved_database_path()?;
    LocalStore::open(&path)
        .with_context(|| format!("Failed to open local store at {}", path.display()))
}

/// Install (or refresh) the rollback ledger for every watched table.
pub fn install_rollback(config: &SyncConfig, store: &LocalStore) -> Result<RollbackHandle> {
    RollbackManager::install(store, &config.watched_tables(), &config.event_column)
        .context("Failed to install rollback ledger (has `shape-sync init` been run?)")
}
