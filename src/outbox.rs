// ABOUTME: Outbox of optimistic local inputs waiting to be submitted
// ABOUTME: Applies client-side plans locally and remembers the raw input text

use chrono::Utc;

use crate::domain::{plan_input, WriteAuthority};
use crate::error::SyncResult;
use crate::store::{self, LocalStore, SqlValue};

pub const OUTBOX_TABLE: &str = "pending_input";

/// An input applied locally and queued for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedInput {
    pub input: String,
    /// Event id the local write was stamped with.
    pub event_id: i64,
    pub staged_at: String,
}

#[derive(Clone)]
pub struct Outbox {
    store: LocalStore,
    player_id: i64,
}

impl Outbox {
    pub fn open(store: LocalStore, player_id: i64) -> SyncResult<Self> {
        store.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                input TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                staged_at TEXT NOT NULL
            )",
            OUTBOX_TABLE
        ))?;
        Ok(Self { store, player_id })
    }

    /// Apply `input` to the local store as an optimistic client write and
    /// queue it. Returns None for an empty input.
    pub fn stage_input(&self, input: &str) -> SyncResult<Option<StagedInput>> {
        let plan = plan_input(input, self.player_id, WriteAuthority::Client)?;
        if plan.is_empty() {
            return Ok(None);
        }

        let staged = self.store.transaction(|conn| {
            for stmt in &plan {
                store::execute(conn, &stmt.sql, &stmt.params)?;
            }
            let event_id = store::query_i64(conn, "SELECT MAX(event_id) FROM input", &[])?;
            let staged_at = Utc::now().to_rfc3339();
            store::execute(
                conn,
                &format!(
                    "INSERT INTO {} (input, event_id, staged_at) VALUES (?1, ?2, ?3)",
                    OUTBOX_TABLE
                ),
                &[
                    SqlValue::from(input),
                    SqlValue::Integer(event_id),
                    SqlValue::Text(staged_at.clone()),
                ],
            )?;
            Ok(StagedInput {
                input: input.to_string(),
                event_id,
                staged_at,
            })
        })?;

        tracing::info!("Staged input '{}' as local event {}", input, staged.event_id);
        Ok(Some(staged))
    }

    /// Queued inputs, oldest first.
    pub fn pending_inputs(&self) -> SyncResult<Vec<StagedInput>> {
        let rows = self.store.query(
            &format!(
                "SELECT input, event_id, staged_at FROM {} ORDER BY id",
                OUTBOX_TABLE
            ),
            &[],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| StagedInput {
                input: row.get("input").map(ToString::to_string).unwrap_or_default(),
                event_id: row.get("event_id").and_then(SqlValue::as_i64).unwrap_or_default(),
                staged_at: row.get("staged_at").map(ToString::to_string).unwrap_or_default(),
            })
            .collect())
    }

    /// Forget every queued input. Local rows are left to the rollback path.
    pub fn clear_pending(&self) -> SyncResult<usize> {
        self.store
            .execute(&format!("DELETE FROM {}", OUTBOX_TABLE), &[])
    }
}
