// ABOUTME: Rollback manager - tracks unconfirmed local writes in a ledger table
// ABOUTME: Capture triggers on watched tables plus the discard path that undoes them

use crate::error::{SyncError, SyncResult};
use crate::materializer::{ensure_replica_role, REPLICA_ROLE_TABLE};
use crate::store::{self, LocalStore, SqlValue};
use crate::utils::{quote_ident, validate_identifier};

/// Ledger of locally written, not yet confirmed event ids.
pub const LEDGER_TABLE: &str = "local_event";

/// What a rollback removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub events_discarded: usize,
    pub rows_deleted: usize,
}

pub struct RollbackManager;

impl RollbackManager {
    /// Create the ledger and capture triggers, returning the rollback handle.
    ///
    /// Every watched table must exist. Tables without the event column are
    /// left untracked. Safe to call repeatedly: triggers are recreated.
    pub fn install(
        store: &LocalStore,
        tables: &[String],
        event_column: &str,
    ) -> SyncResult<RollbackHandle> {
        validate_identifier(event_column)?;
        for table in tables {
            validate_identifier(table)?;
        }
        ensure_replica_role(store)?;

        let tracked = store.transaction(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (event_id INTEGER PRIMARY KEY)",
                LEDGER_TABLE
            ))?;

            let mut tracked = Vec::with_capacity(tables.len());
            for table in tables {
                let exists = store::query_i64(
                    conn,
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    &[SqlValue::from(table.as_str())],
                )?;
                if exists == 0 {
                    return Err(SyncError::InvalidInput(format!(
                        "watched table '{}' does not exist in the local store",
                        table
                    )));
                }

                let has_column = store::query_i64(
                    conn,
                    "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                    &[SqlValue::from(table.as_str()), SqlValue::from(event_column)],
                )?;
                if has_column == 0 {
                    tracing::warn!(
                        "Table {} has no {} column; local writes to it are not tracked",
                        table,
                        event_column
                    );
                    continue;
                }

                let trigger = quote_ident(&format!("sync_capture_{}", table));
                conn.execute_batch(&format!(
                    "DROP TRIGGER IF EXISTS {trigger};
                     CREATE TRIGGER {trigger} AFTER INSERT ON {table}
                     FOR EACH ROW
                     WHEN (SELECT replica FROM {role}) = 0 AND NEW.{column} IS NOT NULL
                     BEGIN
                         INSERT OR IGNORE INTO {ledger} (event_id) VALUES (NEW.{column});
                     END;",
                    trigger = trigger,
                    table = quote_ident(table),
                    role = REPLICA_ROLE_TABLE,
                    column = quote_ident(event_column),
                    ledger = LEDGER_TABLE,
                ))?;
                tracked.push(table.clone());
            }
            Ok(tracked)
        })?;

        tracing::info!(
            "Rollback ledger installed, tracking {} table(s): {}",
            tracked.len(),
            tracked.join(", ")
        );

        Ok(RollbackHandle {
            store: store.clone(),
            tables: tracked,
            event_column: event_column.to_string(),
        })
    }
}

/// Discards local writes whose events were never confirmed.
#[derive(Clone)]
pub struct RollbackHandle {
    store: LocalStore,
    tables: Vec<String>,
    event_column: String,
}

impl RollbackHandle {
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Event ids currently waiting for confirmation, ascending.
    pub fn pending_events(&self) -> SyncResult<Vec<i64>> {
        let rows = self.store.query(
            &format!("SELECT event_id FROM {} ORDER BY event_id", LEDGER_TABLE),
            &[],
        )?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("event_id").and_then(SqlValue::as_i64))
            .collect())
    }

    /// Delete every row of every tracked table that belongs to a pending
    /// event, then clear the ledger. Runs as one local transaction.
    pub fn rollback(&self) -> SyncResult<RollbackReport> {
        let report = self.store.transaction(|conn| {
            // Rows of one event may reference each other across tables
            conn.pragma_update(None, "defer_foreign_keys", true)?;

            let pending = store::query(
                conn,
                &format!("SELECT event_id FROM {} ORDER BY event_id", LEDGER_TABLE),
                &[],
            )?;

            let mut report = RollbackReport::default();
            for row in pending {
                let Some(event_id) = row.get("event_id").cloned() else {
                    continue;
                };
                for table in &self.tables {
                    report.rows_deleted += store::execute(
                        conn,
                        &format!(
                            "DELETE FROM {} WHERE {} = ?1",
                            quote_ident(table),
                            quote_ident(&self.event_column)
                        ),
                        &[event_id.clone()],
                    )?;
                }
                store::execute(
                    conn,
                    &format!("DELETE FROM {} WHERE event_id = ?1", LEDGER_TABLE),
                    &[event_id],
                )?;
                report.events_discarded += 1;
            }
            Ok(report)
        })?;

        if report.events_discarded > 0 {
            tracing::warn!(
                "Rolled back {} unconfirmed event(s), deleted {} row(s)",
                report.events_discarded,
                report.rows_deleted
            );
        } else {
            tracing::debug!("Rollback found no unconfirmed events");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocalStore {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE input (input TEXT, player_id INTEGER, event_id INTEGER,
                                     PRIMARY KEY (player_id, event_id));
                 CREATE TABLE mutable (key TEXT, val INTEGER, player_id INTEGER, event_id INTEGER,
                                       PRIMARY KEY (player_id, event_id, key));
                 CREATE TABLE notes (body TEXT);",
            )
            .unwrap();
        store
    }

    fn tables() -> Vec<String> {
        vec!["input".to_string(), "mutable".to_string()]
    }

    fn write_event(store: &LocalStore, event_id: i64) {
        store
            .execute(
                "INSERT INTO input (input, player_id, event_id) VALUES ('health:80', 0, ?1)",
                &[SqlValue::Integer(event_id)],
            )
            .unwrap();
        store
            .execute(
                "INSERT INTO mutable (key, val, player_id, event_id) VALUES ('health', 80, 0, ?1)",
                &[SqlValue::Integer(event_id)],
            )
            .unwrap();
    }

    #[test]
    fn test_capture_dedups_per_event() {
        let store = store();
        let handle = RollbackManager::install(&store, &tables(), "event_id").unwrap();
        write_event(&store, 3);
        write_event(&store, 4);
        assert_eq!(handle.pending_events().unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_rollback_removes_every_pending_row() {
        let store = store();
        let handle = RollbackManager::install(&store, &tables(), "event_id").unwrap();

        // Confirmed row written while in replica role: not captured
        store.execute("UPDATE sync_replica_role SET replica = 1", &[]).unwrap();
        write_event(&store, 0);
        store.execute("UPDATE sync_replica_role SET replica = 0", &[]).unwrap();

        write_event(&store, 1);
        write_event(&store, 2);

        let report = handle.rollback().unwrap();
        assert_eq!(
            report,
            RollbackReport {
                events_discarded: 2,
                rows_deleted: 4
            }
        );
        assert!(handle.pending_events().unwrap().is_empty());
        assert_eq!(store.count_rows("input").unwrap(), 1);
        assert_eq!(store.count_rows("mutable").unwrap(), 1);

        // Nothing left to undo
        assert_eq!(handle.rollback().unwrap(), RollbackReport::default());
    }

    #[test]
    fn test_install_is_idempotent() {
        let store = store();
        RollbackManager::install(&store, &tables(), "event_id").unwrap();
        let handle = RollbackManager::install(&store, &tables(), "event_id").unwrap();
        write_event(&store, 9);
        assert_eq!(handle.pending_events().unwrap(), vec![9]);
        let triggers = store
            .query_i64(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE 'sync_capture_%'",
                &[],
            )
            .unwrap();
        assert_eq!(triggers, 2);
    }

    #[test]
    fn test_table_without_event_column_is_untracked() {
        let store = store();
        let watched = vec!["input".to_string(), "notes".to_string()];
        let handle = RollbackManager::install(&store, &watched, "event_id").unwrap();
        assert_eq!(handle.tables(), ["input".to_string()]);
        store.execute("INSERT INTO notes (body) VALUES ('hi')", &[]).unwrap();
        assert!(handle.pending_events().unwrap().is_empty());
    }

    #[test]
    fn test_missing_table_is_rejected() {
        let store = store();
        let watched = vec!["input".to_string(), "absent".to_string()];
        let result = RollbackManager::install(&store, &watched, "event_id");
        assert!(matches!(result, Err(SyncError::InvalidInput(_))));
    }
}
