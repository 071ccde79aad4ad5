// ABOUTME: Shape descriptors - the filtered table subsets being synchronized
// ABOUTME: Renders the `where` predicate sent to the change-log service

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SyncResult;
use crate::utils::{quote_literal, validate_identifier};

/// Value a shape filter compares a column against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Bool(b) => write!(f, "{}", b),
            FilterValue::Integer(i) => write!(f, "{}", i),
            FilterValue::Text(s) => write!(f, "{}", quote_literal(s)),
        }
    }
}

/// Equality filter on a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: FilterValue,
}

/// A logical subset of one table, tracked as an independent change-log subscription.
///
/// Immutable for the lifetime of a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    pub table: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl ShapeDescriptor {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
        }
    }

    /// Add an equality filter (builder style).
    pub fn with_filter(mut self, column: impl Into<String>, value: FilterValue) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            value,
        });
        self
    }

    /// Check the table and every filtered column are plain identifiers.
    pub fn validate(&self) -> SyncResult<()> {
        validate_identifier(&self.table)?;
        for filter in &self.filters {
            validate_identifier(&filter.column)?;
        }
        Ok(())
    }

    /// Render the filters as `col=value AND col=value`, or None without filters.
    pub fn where_clause(&self) -> Option<String> {
        if self.filters.is_empty() {
            return None;
        }
        Some(
            self.filters
                .iter()
                .map(|f| format!("{}={}", f.column, f.value))
                .collect::<Vec<_>>()
                .join(" AND "),
        )
    }
}

impl fmt::Display for ShapeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.where_clause() {
            Some(predicate) => write!(f, "{} [{}]", self.table, predicate),
            None => write!(f, "{}", self.table),
        }
    }
}
