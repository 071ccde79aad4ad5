// ABOUTME: Embedded SQLite store used as the local replica
// ABOUTME: Parameterized query/execute helpers and scoped transactions

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

use crate::error::{SyncError, SyncResult};
use crate::utils::{quote_ident, validate_identifier};

/// A single bound value. Every statement the engine runs binds its values
/// through this type; only validated identifiers are ever interpolated.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                SqlValue::Text(String::from_utf8_lossy(t).into_owned())
            }
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{}", i),
            SqlValue::Real(r) => write!(f, "{}", r),
            SqlValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One result row keyed by column name.
pub type RowMap = BTreeMap<String, SqlValue>;

/// Handle to the local SQLite replica.
///
/// Cloning is cheap; all clones share one connection behind a mutex, so
/// callers must not hold a transaction across an `.await`. Async code runs
/// store work through `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct LocalStore {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Open (or create) a store file, enabling WAL and foreign key enforcement.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    SyncError::Config(format!(
                        "failed to create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        if let Err(e) = conn.pragma_update(None, "synchronous", "normal") {
            tracing::warn!("Failed to set synchronous=normal on {}: {}", path.display(), e);
        }
        conn.pragma_update(None, "foreign_keys", true)?;
        tracing::debug!("Opened local store at {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self {
            path: None,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a non-parameterized script (DDL, multiple statements).
    pub fn execute_batch(&self, sql: &str) -> SyncResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    /// Run one parameterized statement, returning the affected row count.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> SyncResult<usize> {
        let conn = self.conn.lock();
        execute(&conn, sql, params)
    }

    /// Run a parameterized query and collect every row.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> SyncResult<Vec<RowMap>> {
        let conn = self.conn.lock();
        query(&conn, sql, params)
    }

    /// Run a query returning a single integer (COUNT, MAX...).
    pub fn query_i64(&self, sql: &str, params: &[SqlValue]) -> SyncResult<i64> {
        let conn = self.conn.lock();
        query_i64(&conn, sql, params)
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`; any error (or a panic unwinding through
    /// the closure) drops the transaction, which rolls it back.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Exclusive access to the raw connection, for connection-level pragmas
    /// that must be issued outside a transaction.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    pub fn table_exists(&self, table: &str) -> SyncResult<bool> {
        let count = self.query_i64(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            &[SqlValue::from(table)],
        )?;
        Ok(count > 0)
    }

    pub fn count_rows(&self, table: &str) -> SyncResult<i64> {
        validate_identifier(table)?;
        self.query_i64(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), &[])
    }
}

pub(crate) fn execute(conn: &Connection, sql: &str, params: &[SqlValue]) -> SyncResult<usize> {
    Ok(conn.execute(sql, params_from_iter(params.iter()))?)
}

pub(crate) fn query(conn: &Connection, sql: &str, params: &[SqlValue]) -> SyncResult<Vec<RowMap>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = RowMap::new();
        for (idx, name) in names.iter().enumerate() {
            map.insert(name.clone(), SqlValue::from(row.get_ref(idx)?));
        }
        out.push(map);
    }
    Ok(out)
}

pub(crate) fn query_i64(conn: &Connection, sql: &str, params: &[SqlValue]) -> SyncResult<i64> {
    let value: Option<i64> = conn.query_row(sql, params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(value.unwrap_or(0))
}
