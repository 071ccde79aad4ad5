// ABOUTME: Library root for shape-sync
// ABOUTME: Exports the sync engine, the local store and the CLI command handlers

pub mod aggregator;
pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod materializer;
pub mod orchestrator;
pub mod outbox;
pub mod protocol;
pub mod rollback;
pub mod schema;
pub mod shape;
pub mod store;
pub mod submit;
pub mod utils;

pub use config::{IntegrityMode, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{ChangeObserver, CycleStats, LoggingObserver, SyncOrchestrator};
pub use store::{LocalStore, SqlValue};
