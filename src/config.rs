// ABOUTME: Sync client configuration loaded from TOML
// ABOUTME: Defaults reproduce the two-shape demo deployment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::shape::{FilterValue, ShapeDescriptor};
use crate::utils::{expand_home, validate_identifier};

/// Whether referential integrity is relaxed while a remote transaction is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    /// Foreign keys are switched off for the duration of each local transaction.
    #[default]
    Suspended,
    /// Foreign keys stay on; cross-table events must arrive parent-first.
    Enforced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Change-log shape endpoint
    pub shape_url: String,
    /// Submission endpoint for staged local inputs
    pub submit_url: String,
    /// Local SQLite replica (`~` is expanded)
    pub database_path: PathBuf,
    pub player_id: i64,
    /// Column carrying the event id in every watched table
    pub event_column: String,
    /// Watched shapes; the first one is the primary
    pub shapes: Vec<ShapeDescriptor>,
    pub min_cycle_interval_ms: u64,
    /// Must exceed the service's long-poll hold time
    pub request_timeout_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Aggregator size at which polling pauses
    pub max_pending_transactions: usize,
    pub integrity: IntegrityMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let player = FilterValue::Integer(0);
        Self {
            shape_url: "http://localhost:3000/v1/shape".to_string(),
            submit_url: "http://localhost:3112/submit".to_string(),
            database_path: PathBuf::from("~/.shape-sync/local.db"),
            player_id: 0,
            event_column: "event_id".to_string(),
            shapes: vec![
                ShapeDescriptor::new("input").with_filter("player_id", player.clone()),
                ShapeDescriptor::new("mutable").with_filter("player_id", player),
            ],
            min_cycle_interval_ms: 250,
            request_timeout_secs: 60,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            max_pending_transactions: 10_000,
            integrity: IntegrityMode::Suspended,
        }
    }
}

impl SyncConfig {
    /// Read a TOML config file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: SyncConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` when given, otherwise fall back to the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.shapes.is_empty() {
            return Err(SyncError::Config(
                "at least one shape must be configured".to_string(),
            ));
        }
        for shape in &self.shapes {
            shape
                .validate()
                .map_err(|e| SyncError::Config(format!("shape '{}': {}", shape.table, e)))?;
        }
        validate_identifier(&self.event_column)
            .map_err(|e| SyncError::Config(format!("event_column: {}", e)))?;
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(SyncError::Config(format!(
                "backoff_max_ms ({}) is smaller than backoff_initial_ms ({})",
                self.backoff_max_ms, self.backoff_initial_ms
            )));
        }
        if self.max_pending_transactions == 0 {
            return Err(SyncError::Config(
                "max_pending_transactions must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        expand_home(self.database_path.clone())
    }

    /// Names of every watched table, primary first, without duplicates.
    pub fn watched_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::with_capacity(self.shapes.len());
        for shape in &self.shapes {
            if !tables.contains(&shape.table) {
                tables.push(shape.table.clone());
            }
        }
        tables
    }

    pub fn min_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.min_cycle_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}
