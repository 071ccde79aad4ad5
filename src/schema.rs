// ABOUTME: Column schemas learned from the change-log service
// ABOUTME: Shared per-table cache plus JSON value coercion for local binding

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::store::SqlValue;

/// Storage class a column's values are bound as locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Boolean,
    Text,
}

impl ColumnType {
    /// Map a server-side type name (`int4`, `varchar`, ...) onto a local storage class.
    pub fn from_type_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "int2" | "int4" | "int8" | "integer" | "bigint" | "smallint" | "oid" => {
                ColumnType::Integer
            }
            "float4" | "float8" | "numeric" | "real" | "double precision" => ColumnType::Real,
            "bool" | "boolean" => ColumnType::Boolean,
            _ => ColumnType::Text,
        }
    }
}

/// Schema entry for a single column, as sent in the `electric-schema` header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_index: Option<u32>,
}

impl ColumnSchema {
    pub fn column_type(&self) -> ColumnType {
        ColumnType::from_type_name(&self.type_name)
    }

    pub fn is_primary_key(&self) -> bool {
        self.pk_index.is_some()
    }
}

/// Column name -> schema for one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    columns: HashMap<String, ColumnSchema>,
}

impl TableSchema {
    /// Parse the JSON carried by the `electric-schema` header.
    pub fn from_header(raw: &str) -> SyncResult<Self> {
        let columns: HashMap<String, ColumnSchema> = serde_json::from_str(raw)
            .map_err(|e| SyncError::Protocol(format!("invalid schema header: {}", e)))?;
        Ok(Self { columns })
    }

    pub fn from_columns(columns: HashMap<String, ColumnSchema>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.get(name)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.columns
            .get(name)
            .map(ColumnSchema::is_primary_key)
            .unwrap_or(false)
    }

    /// Primary key columns in key order.
    pub fn primary_key(&self) -> Vec<&str> {
        let mut pk: Vec<(&str, u32)> = self
            .columns
            .iter()
            .filter_map(|(name, col)| col.pk_index.map(|idx| (name.as_str(), idx)))
            .collect();
        pk.sort_by_key(|(_, idx)| *idx);
        pk.into_iter().map(|(name, _)| name).collect()
    }

    /// Convert a JSON value from a change message into a bindable value.
    ///
    /// The change log sends most values as strings; numeric and boolean
    /// columns are parsed back into their storage class. Values that fail to
    /// parse are bound as text and left to SQLite's column affinity.
    pub fn coerce(&self, column: &str, value: &Value) -> SqlValue {
        match self.column(column).map(ColumnSchema::column_type) {
            Some(ty) => coerce_value(ty, value),
            None => coerce_untyped(value),
        }
    }
}

fn coerce_value(ty: ColumnType, value: &Value) -> SqlValue {
    match (ty, value) {
        (_, Value::Null) => SqlValue::Null,
        (ColumnType::Integer, Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Text(n.to_string()),
        },
        (ColumnType::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => SqlValue::Integer(i),
            Err(_) => SqlValue::Text(s.clone()),
        },
        (ColumnType::Real, Value::Number(n)) => match n.as_f64() {
            Some(f) => SqlValue::Real(f),
            None => SqlValue::Text(n.to_string()),
        },
        (ColumnType::Real, Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) => SqlValue::Real(f),
            Err(_) => SqlValue::Text(s.clone()),
        },
        (ColumnType::Boolean, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        (ColumnType::Boolean, Value::String(s)) => match s.as_str() {
            "t" | "true" => SqlValue::Integer(1),
            "f" | "false" => SqlValue::Integer(0),
            _ => SqlValue::Text(s.clone()),
        },
        (ColumnType::Text, Value::String(s)) => SqlValue::Text(s.clone()),
        (_, other) => coerce_untyped(other),
    }
}

fn coerce_untyped(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Process-wide cache of learned table schemas, shared by handle between
/// the fetchers (which fill it) and the materializer (which reads it).
///
/// Entries are written once per table and never refreshed: the schema is
/// assumed stable for the whole session.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    inner: Arc<RwLock<HashMap<String, TableSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.inner.read().contains_key(table)
    }

    pub fn get(&self, table: &str) -> Option<TableSchema> {
        self.inner.read().get(table).cloned()
    }

    /// Look a schema up, failing loudly when it has not been learned yet.
    pub fn require(&self, table: &str) -> SyncResult<TableSchema> {
        self.get(table).ok_or_else(|| SyncError::SchemaMissing {
            table: table.to_string(),
        })
    }

    /// Store a schema unless one is already known. Returns true if stored.
    pub fn insert_if_absent(&self, table: &str, schema: TableSchema) -> bool {
        let mut guard = self.inner.write();
        if guard.contains_key(table) {
            return false;
        }
        guard.insert(table.to_string(), schema);
        true
    }

    pub fn tables(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}
