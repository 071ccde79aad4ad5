// ABOUTME: Wire types for the change-log shape protocol
// ABOUTME: Header names, change messages and their conversion into change events

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

pub const SCHEMA_HEADER: &str = "electric-schema";
pub const OFFSET_HEADER: &str = "electric-offset";
pub const HANDLE_HEADER: &str = "electric-handle";
pub const UP_TO_DATE_HEADER: &str = "electric-up-to-date";

/// Offset that asks the service for a shape from the very beginning.
pub const INITIAL_OFFSET: &str = "-1";

/// Transaction identifier. `0` groups changes that carried none.
pub type TxId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageHeaders {
    #[serde(default)]
    pub operation: Option<Operation>,
    #[serde(default, deserialize_with = "deserialize_txid")]
    pub txid: Option<TxId>,
    #[serde(default, deserialize_with = "deserialize_txids")]
    pub txids: Vec<TxId>,
    #[serde(default)]
    pub relation: Option<Vec<String>>,
    #[serde(default)]
    pub control: Option<String>,
}

impl MessageHeaders {
    /// The grouping key for this message; `0` when the log gave none.
    pub fn transaction_id(&self) -> TxId {
        self.txid
            .or_else(|| self.txids.first().copied())
            .unwrap_or(0)
    }
}

/// One element of a shape response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeMessage {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<Map<String, Value>>,
    #[serde(default)]
    pub headers: MessageHeaders,
}

/// A single row mutation, grouped by transaction in the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: Operation,
    /// Schema-qualified table path, e.g. `["public", "input"]`.
    pub relation: Vec<String>,
    pub value: Map<String, Value>,
}

impl ChangeEvent {
    /// Local table name: the last element of the relation path.
    pub fn table(&self) -> &str {
        self.relation.last().map(String::as_str).unwrap_or("")
    }
}

/// Decode a response body into `(txid, event)` pairs, in body order.
///
/// Control messages (no `value`) are skipped, as is any data message without
/// an operation; the rest of the page is kept. Only a body that is not a
/// message list at all is rejected.
pub fn decode_events(body: &[u8], default_table: &str) -> SyncResult<Vec<(TxId, ChangeEvent)>> {
    let messages: Vec<ChangeMessage> = serde_json::from_slice(body)
        .map_err(|e| SyncError::Protocol(format!("invalid shape response body: {}", e)))?;

    let mut events = Vec::with_capacity(messages.len());
    for msg in messages {
        let Some(value) = msg.value else {
            continue;
        };
        let Some(operation) = msg.headers.operation else {
            tracing::warn!(
                "Skipping change message {} on {}: value without an operation",
                msg.key.as_deref().unwrap_or("<no key>"),
                default_table
            );
            continue;
        };
        let txid = msg.headers.transaction_id();
        let relation = msg
            .headers
            .relation
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| vec![default_table.to_string()]);
        events.push((
            txid,
            ChangeEvent {
                operation,
                relation,
                value,
            },
        ));
    }
    Ok(events)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

impl NumberOrString {
    fn into_txid<E: serde::de::Error>(self) -> Result<TxId, E> {
        match self {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::String(s) => s
                .parse()
                .map_err(|_| E::custom(format!("invalid txid '{}'", s))),
        }
    }
}

fn deserialize_txid<'de, D>(deserializer: D) -> Result<Option<TxId>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<NumberOrString>::deserialize(deserializer)?
        .map(NumberOrString::into_txid)
        .transpose()
}

fn deserialize_txids<'de, D>(deserializer: D) -> Result<Vec<TxId>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<NumberOrString>>::deserialize(deserializer)?
        .unwrap_or_default()
        .into_iter()
        .map(NumberOrString::into_txid)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_skips_control_messages() {
        let body = br#"[
            {"key": "\"public\".\"input\"/\"0\"/\"1\"",
             "value": {"input": "health:80", "player_id": "0", "event_id": "1"},
             "headers": {"operation": "insert", "txid": 812, "relation": ["public", "input"]}},
            {"headers": {"control": "up-to-date"}}
        ]"#;
        let events = decode_events(body, "input").unwrap();
        assert_eq!(events.len(), 1);
        let (txid, event) = &events[0];
        assert_eq!(*txid, 812);
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.table(), "input");
        assert_eq!(event.value["input"], "health:80");
    }

    #[test]
    fn test_txid_variants() {
        let body = br#"[
            {"value": {"a": 1}, "headers": {"operation": "update", "txid": "77"}},
            {"value": {"a": 2}, "headers": {"operation": "delete", "txids": [91, 92]}},
            {"value": {"a": 3}, "headers": {"operation": "insert"}}
        ]"#;
        let events = decode_events(body, "things").unwrap();
        let txids: Vec<TxId> = events.iter().map(|(t, _)| *t).collect();
        assert_eq!(txids, vec![77, 91, 0]);
        // Relation falls back to the polled table
        assert_eq!(events[0].1.relation, vec!["things".to_string()]);
    }

    #[test]
    fn test_message_without_operation_is_skipped() {
        let body = br#"[
            {"value": {"a": 1}, "headers": {"operation": "insert", "txid": 2}},
            {"value": {"a": 2}, "headers": {"txid": 3}},
            {"value": {"a": 3}, "headers": {"operation": "delete", "txid": 3}}
        ]"#;
        let events = decode_events(body, "t").unwrap();
        let kept: Vec<(TxId, Operation)> = events.iter().map(|(t, e)| (*t, e.operation)).collect();
        assert_eq!(kept, vec![(2, Operation::Insert), (3, Operation::Delete)]);
    }

    #[test]
    fn test_malformed_body_is_protocol_error() {
        assert!(matches!(
            decode_events(b"{not json", "t"),
            Err(SyncError::Protocol(_))
        ));
        assert!(matches!(
            decode_events(br#"[{"value": {}, "headers": {"operation": "insert", "txid": "abc"}}]"#, "t"),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_empty_body_list() {
        assert!(decode_events(b"[]", "t").unwrap().is_empty());
    }
}
