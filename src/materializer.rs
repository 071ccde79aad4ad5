// ABOUTME: Materializer - applies buffered remote transactions to the local store
// ABOUTME: One local transaction per remote txid with integrity checks suspended

use rusqlite::Connection;
use serde_json::Value;

use crate::aggregator::TransactionBuffer;
use crate::config::IntegrityMode;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ChangeEvent, Operation, TxId};
use crate::rollback::LEDGER_TABLE;
use crate::schema::{SchemaCache, TableSchema};
use crate::store::{self, LocalStore, SqlValue};
use crate::utils::{quote_ident, validate_identifier};

/// One-row table standing in for a replication role: ledger capture
/// triggers only fire while `replica = 0`.
pub const REPLICA_ROLE_TABLE: &str = "sync_replica_role";

/// Create the replica role table if needed and leave it in the origin role.
pub fn ensure_replica_role(store: &LocalStore) -> SyncResult<()> {
    store.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (replica INTEGER NOT NULL);
         INSERT INTO {table} (replica)
             SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {table});",
        table = REPLICA_ROLE_TABLE
    ))
}

fn set_replica_role(conn: &Connection, replica: bool) -> SyncResult<()> {
    store::execute(
        conn,
        &format!("UPDATE {} SET replica = ?1", REPLICA_ROLE_TABLE),
        &[SqlValue::Integer(i64::from(replica))],
    )?;
    Ok(())
}

/// Turns foreign key enforcement off for as long as it lives.
///
/// SQLite ignores `PRAGMA foreign_keys` inside a transaction, so the guard
/// must be created before `BEGIN` and dropped after the transaction ends.
struct ForeignKeysSuspended<'c> {
    conn: &'c Connection,
}

impl<'c> ForeignKeysSuspended<'c> {
    fn new(conn: &'c Connection) -> SyncResult<Self> {
        conn.pragma_update(None, "foreign_keys", false)?;
        Ok(Self { conn })
    }
}

impl Drop for ForeignKeysSuspended<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.pragma_update(None, "foreign_keys", true) {
            tracing::error!("Failed to re-enable foreign keys: {}", e);
        }
    }
}

/// Outcome of a successful [`Materializer::materialize`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Transactions committed and removed from the buffer, in apply order.
    pub committed: Vec<TxId>,
    pub events_applied: usize,
}

/// Applies grouped change events to the local store.
///
/// Cheap to clone; intended to be moved into `spawn_blocking`.
#[derive(Clone)]
pub struct Materializer {
    store: LocalStore,
    schemas: SchemaCache,
    buffer: TransactionBuffer,
    event_column: String,
    integrity: IntegrityMode,
}

impl Materializer {
    pub fn new(
        store: LocalStore,
        schemas: SchemaCache,
        buffer: TransactionBuffer,
        event_column: impl Into<String>,
        integrity: IntegrityMode,
    ) -> SyncResult<Self> {
        let event_column = event_column.into();
        validate_identifier(&event_column)?;
        ensure_replica_role(&store)?;
        Ok(Self {
            store,
            schemas,
            buffer,
            event_column,
            integrity,
        })
    }

    /// Apply each transaction in order, each inside its own local transaction.
    ///
    /// Stops at the first failure. The failing transaction's local writes are
    /// rolled back and its events stay buffered; transactions committed before
    /// it stay committed. The caller owns the recovery path.
    pub fn materialize(&self, txids: &[TxId]) -> SyncResult<MaterializeReport> {
        let mut report = MaterializeReport::default();

        for &txid in txids {
            let Some(events) = self.buffer.get(txid) else {
                continue;
            };
            if events.is_empty() {
                self.buffer.complete(txid, 0);
                continue;
            }

            if let Err(source) = self.apply_transaction(&events) {
                tracing::error!(
                    "Materialization of transaction {} failed after {} committed: {}",
                    txid,
                    report.committed.len(),
                    source
                );
                return Err(SyncError::Materialization {
                    txid,
                    committed: report.committed,
                    source: Box::new(source),
                });
            }

            self.buffer.complete(txid, events.len());
            tracing::debug!(txid, events = events.len(), "Materialized transaction");
            report.committed.push(txid);
            report.events_applied += events.len();
        }

        Ok(report)
    }

    fn apply_transaction(&self, events: &[ChangeEvent]) -> SyncResult<()> {
        self.store.with_connection(|conn| {
            let _fk = match self.integrity {
                IntegrityMode::Suspended => Some(ForeignKeysSuspended::new(conn)?),
                IntegrityMode::Enforced => None,
            };
            let tx = conn.unchecked_transaction()?;
            set_replica_role(&tx, true)?;
            let ledger = ledger_present(&tx)?;

            for event in events {
                self.apply_event(&tx, event, ledger)?;
            }

            set_replica_role(&tx, false)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn apply_event(&self, conn: &Connection, event: &ChangeEvent, ledger: bool) -> SyncResult<()> {
        let table = event.table();
        validate_identifier(table)?;
        let schema = self.schemas.require(table)?;
        for column in event.value.keys() {
            validate_identifier(column)?;
        }
        if event.value.is_empty() {
            return Err(SyncError::InvalidInput(format!(
                "{} on {} carries no columns",
                event.operation.as_str(),
                table
            )));
        }

        match event.operation {
            Operation::Insert => self.apply_insert(conn, table, &schema, event, ledger),
            Operation::Update => apply_update(conn, table, &schema, event),
            Operation::Delete => apply_delete(conn, table, &schema, event),
        }
    }

    fn apply_insert(
        &self,
        conn: &Connection,
        table: &str,
        schema: &TableSchema,
        event: &ChangeEvent,
        ledger: bool,
    ) -> SyncResult<()> {
        let (predicate, values) = match_all(schema, event);
        let existing = store::query_i64(
            conn,
            &format!("SELECT COUNT(*) FROM {} WHERE {}", quote_ident(table), predicate),
            &values,
        )?;

        if existing == 0 {
            let columns: Vec<String> = event.value.keys().map(|c| quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            store::execute(
                conn,
                &format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(table),
                    columns.join(", "),
                    placeholders.join(", ")
                ),
                &values,
            )?;
        } else {
            tracing::trace!("Row already present in {}, skipping insert", table);
        }

        // A remote row carrying an event id confirms the matching local write
        if ledger {
            let event_id = event
                .value
                .get(&self.event_column)
                .map(|v| schema.coerce(&self.event_column, v))
                .filter(|v| !v.is_null());
            if let Some(event_id) = event_id {
                store::execute(
                    conn,
                    &format!("DELETE FROM {} WHERE event_id = ?1", LEDGER_TABLE),
                    &[event_id],
                )?;
            }
        }
        Ok(())
    }
}

/// `"a" IS ?1 AND "b" IS ?2` over every provided column, with bound values.
///
/// `IS` keeps the match exact when a column is NULL.
fn match_all(schema: &TableSchema, event: &ChangeEvent) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::with_capacity(event.value.len());
    let mut values = Vec::with_capacity(event.value.len());
    for (idx, (column, value)) in event.value.iter().enumerate() {
        clauses.push(format!("{} IS ?{}", quote_ident(column), idx + 1));
        values.push(schema.coerce(column, value));
    }
    (clauses.join(" AND "), values)
}

fn apply_update(
    conn: &Connection,
    table: &str,
    schema: &TableSchema,
    event: &ChangeEvent,
) -> SyncResult<()> {
    let (keys, others): (Vec<(&String, &Value)>, Vec<(&String, &Value)>) = event
        .value
        .iter()
        .partition(|(column, _)| schema.is_primary_key(column));

    if keys.is_empty() {
        return Err(SyncError::InvalidInput(format!(
            "update on {} carries no primary key columns",
            table
        )));
    }
    if others.is_empty() {
        return Ok(());
    }

    let mut values = Vec::with_capacity(event.value.len());
    let mut assignments = Vec::with_capacity(others.len());
    for (column, value) in &others {
        values.push(schema.coerce(column, value));
        assignments.push(format!("{} = ?{}", quote_ident(column), values.len()));
    }
    let mut conditions = Vec::with_capacity(keys.len());
    for (column, value) in &keys {
        values.push(schema.coerce(column, value));
        conditions.push(format!("{} = ?{}", quote_ident(column), values.len()));
    }

    let changed = store::execute(
        conn,
        &format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            assignments.join(", "),
            conditions.join(" AND ")
        ),
        &values,
    )?;
    if changed == 0 {
        tracing::debug!("Update on {} matched no local row", table);
    }
    Ok(())
}

fn apply_delete(
    conn: &Connection,
    table: &str,
    schema: &TableSchema,
    event: &ChangeEvent,
) -> SyncResult<()> {
    let (predicate, values) = match_all(schema, event);
    store::execute(
        conn,
        &format!("DELETE FROM {} WHERE {}", quote_ident(table), predicate),
        &values,
    )?;
    Ok(())
}

fn ledger_present(conn: &Connection) -> SyncResult<bool> {
    let count = store::query_i64(
        conn,
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        &[SqlValue::from(LEDGER_TABLE)],
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::RollbackManager;
    use serde_json::json;

    const PARENT_SCHEMA: &str = r#"{"id": {"type": "int4", "pk_index": 0}, "name": {"type": "text"}}"#;
    const CHILD_SCHEMA: &str = r#"{
        "id": {"type": "int4", "pk_index": 0},
        "parent_id": {"type": "int4"},
        "event_id": {"type": "int4"}
    }"#;

    struct Fixture {
        store: LocalStore,
        buffer: TransactionBuffer,
        materializer: Materializer,
    }

    fn fixture(integrity: IntegrityMode) -> Fixture {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE child (
                     id INTEGER PRIMARY KEY,
                     parent_id INTEGER REFERENCES parent(id),
                     event_id INTEGER
                 );",
            )
            .unwrap();
        let schemas = SchemaCache::new();
        schemas.insert_if_absent("parent", TableSchema::from_header(PARENT_SCHEMA).unwrap());
        schemas.insert_if_absent("child", TableSchema::from_header(CHILD_SCHEMA).unwrap());
        let buffer = TransactionBuffer::new();
        let materializer =
            Materializer::new(store.clone(), schemas, buffer.clone(), "event_id", integrity)
                .unwrap();
        Fixture {
            store,
            buffer,
            materializer,
        }
    }

    fn event(operation: Operation, table: &str, value: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            operation,
            relation: vec!["public".into(), table.into()],
            value: value.as_object().cloned().unwrap(),
        }
    }

    fn parent(id: i64) -> ChangeEvent {
        event(Operation::Insert, "parent", json!({"id": id.to_string(), "name": "p"}))
    }

    fn child(id: i64, parent_id: i64) -> ChangeEvent {
        event(
            Operation::Insert,
            "child",
            json!({"id": id.to_string(), "parent_id": parent_id.to_string(), "event_id": id.to_string()}),
        )
    }

    #[test]
    fn test_insert_is_idempotent() {
        let f = fixture(IntegrityMode::Suspended);
        f.buffer.append(1, parent(1));
        f.materializer.materialize(&[1]).unwrap();

        // Redelivery of the same row
        f.buffer.append(2, parent(1));
        let report = f.materializer.materialize(&[2]).unwrap();
        assert_eq!(report.committed, vec![2]);
        assert_eq!(f.store.count_rows("parent").unwrap(), 1);
        assert!(f.buffer.is_empty());
    }

    #[test]
    fn test_child_before_parent_with_integrity_suspended() {
        let f = fixture(IntegrityMode::Suspended);
        f.buffer.extend(vec![(7, child(10, 1)), (7, parent(1))]);
        f.materializer.materialize(&[7]).unwrap();
        assert_eq!(f.store.count_rows("child").unwrap(), 1);
        assert_eq!(f.store.count_rows("parent").unwrap(), 1);

        // Enforcement is back on after the transaction
        assert_eq!(f.store.query_i64("PRAGMA foreign_keys", &[]).unwrap(), 1);
    }

    #[test]
    fn test_child_before_parent_fails_when_enforced() {
        let f = fixture(IntegrityMode::Enforced);
        f.buffer.extend(vec![(7, child(10, 1)), (7, parent(1))]);
        let err = f.materializer.materialize(&[7]).unwrap_err();
        assert!(matches!(err, SyncError::Materialization { txid: 7, .. }));
        assert_eq!(f.store.count_rows("child").unwrap(), 0);
        assert_eq!(f.store.count_rows("parent").unwrap(), 0);
    }

    #[test]
    fn test_permutations_yield_same_rows() {
        let canonical = vec![parent(1), child(10, 1), child(11, 1)];
        let permuted = vec![child(11, 1), child(10, 1), parent(1)];

        let mut results = Vec::new();
        for events in [canonical, permuted] {
            let f = fixture(IntegrityMode::Suspended);
            f.buffer.extend(events.into_iter().map(|e| (3, e)));
            f.materializer.materialize(&[3]).unwrap();
            results.push(f.store.query("SELECT * FROM child ORDER BY id", &[]).unwrap());
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].len(), 2);
    }

    #[test]
    fn test_partial_failure_rolls_back_and_keeps_transaction() {
        let f = fixture(IntegrityMode::Suspended);
        // Second event targets a table with no learned schema
        f.buffer.extend(vec![
            (4, parent(1)),
            (4, event(Operation::Insert, "unknown", json!({"id": "1"}))),
        ]);
        let err = f.materializer.materialize(&[4]).unwrap_err();
        match err {
            SyncError::Materialization {
                txid,
                committed,
                source,
            } => {
                assert_eq!(txid, 4);
                assert!(committed.is_empty());
                assert!(matches!(*source, SyncError::SchemaMissing { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(f.store.count_rows("parent").unwrap(), 0);
        assert_eq!(f.buffer.get(4).unwrap().len(), 2);
    }

    #[test]
    fn test_stops_at_first_failure() {
        let f = fixture(IntegrityMode::Suspended);
        f.buffer.append(1, parent(1));
        f.buffer.append(2, event(Operation::Insert, "unknown", json!({"id": "1"})));
        f.buffer.append(3, parent(3));

        let err = f.materializer.materialize(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Materialization { txid: 2, ref committed, .. } if committed == &vec![1]
        ));
        assert_eq!(f.buffer.snapshot(), vec![2, 3]);
        assert_eq!(f.store.count_rows("parent").unwrap(), 1);
    }

    #[test]
    fn test_update_by_primary_key() {
        let f = fixture(IntegrityMode::Suspended);
        f.buffer.append(1, parent(1));
        f.buffer.append(1, parent(2));
        f.buffer.append(
            2,
            event(Operation::Update, "parent", json!({"id": "2", "name": "renamed"})),
        );
        f.materializer.materialize(&f.buffer.snapshot()).unwrap();

        let rows = f.store.query("SELECT id, name FROM parent ORDER BY id", &[]).unwrap();
        assert_eq!(rows[0]["name"], SqlValue::from("p"));
        assert_eq!(rows[1]["name"], SqlValue::from("renamed"));
    }

    #[test]
    fn test_update_without_key_fails() {
        let f = fixture(IntegrityMode::Suspended);
        f.buffer
            .append(1, event(Operation::Update, "parent", json!({"name": "everyone"})));
        assert!(f.materializer.materialize(&[1]).is_err());
    }

    #[test]
    fn test_delete_matches_all_columns() {
        let f = fixture(IntegrityMode::Suspended);
        f.buffer.extend(vec![(1, parent(1)), (1, parent(2))]);
        f.buffer.append(
            2,
            event(Operation::Delete, "parent", json!({"id": "1", "name": "other"})),
        );
        f.buffer.append(
            3,
            event(Operation::Delete, "parent", json!({"id": "2", "name": "p"})),
        );
        f.materializer.materialize(&[1, 2, 3]).unwrap();

        let rows = f.store.query("SELECT id FROM parent", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], SqlValue::Integer(1));
    }

    #[test]
    fn test_confirmed_insert_clears_ledger_entry() {
        let f = fixture(IntegrityMode::Suspended);
        let handle = RollbackManager::install(&f.store, &["child".to_string()], "event_id").unwrap();

        // Optimistic local write captured by the ledger
        f.store.execute("INSERT INTO parent (id, name) VALUES (1, 'p')", &[]).unwrap();
        f.store
            .execute("INSERT INTO child (id, parent_id, event_id) VALUES (10, 1, 10)", &[])
            .unwrap();
        assert_eq!(handle.pending_events().unwrap(), vec![10]);

        // The authoritative copy arrives
        f.buffer.append(5, child(10, 1));
        f.materializer.materialize(&[5]).unwrap();
        assert!(handle.pending_events().unwrap().is_empty());
        assert_eq!(f.store.count_rows("child").unwrap(), 1);

        // Remote inserts never create ledger entries
        f.buffer.append(6, child(11, 1));
        f.materializer.materialize(&[6]).unwrap();
        assert!(handle.pending_events().unwrap().is_empty());
        assert_eq!(f.store.count_rows("child").unwrap(), 2);
    }
}
