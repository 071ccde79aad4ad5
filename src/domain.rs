// ABOUTME: Game input domain - expands "key:value|key:value" inputs into statements
// ABOUTME: Shared by the optimistic client path and the authoritative submit server

use crate::error::{SyncError, SyncResult};
use crate::store::SqlValue;

/// Who is writing an input. Only the server prunes superseded mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAuthority {
    /// Optimistic local write; history is kept until the server's version arrives.
    Client,
    /// Authoritative write into the change log's source database.
    Server,
}

/// One parameterized statement.
///
/// Placeholders are `CAST($n AS ...)` so the same text runs on SQLite and
/// PostgreSQL; they appear in ascending order, matching `params`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

const INSERT_INPUT: &str = "INSERT INTO input (input, player_id, event_id) \
     SELECT CAST($1 AS TEXT), CAST($2 AS INTEGER), COALESCE(MAX(event_id), -1) + 1 FROM input";

const INSERT_MUTATION: &str = "INSERT INTO mutable (key, val, player_id, event_id) \
     SELECT CAST($1 AS TEXT), CAST($2 AS INTEGER), CAST($3 AS INTEGER), MAX(event_id) FROM input";

const PRUNE_MUTATIONS: &str = "DELETE FROM mutable \
     WHERE player_id = CAST($1 AS INTEGER) AND key = CAST($2 AS TEXT) \
     AND event_id <> (SELECT MAX(event_id) FROM mutable \
                      WHERE key = CAST($2 AS TEXT) AND player_id = CAST($1 AS INTEGER))";

/// Split an input into its `(key, value)` pairs.
///
/// ```
/// # use shape_sync::domain::parse_input;
/// let pairs = parse_input("health:80|xp:5").unwrap();
/// assert_eq!(pairs, vec![("health".to_string(), 80), ("xp".to_string(), 5)]);
/// ```
pub fn parse_input(input: &str) -> SyncResult<Vec<(String, i64)>> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    input
        .split('|')
        .map(|pair| {
            let (key, value) = pair.split_once(':').ok_or_else(|| {
                SyncError::InvalidInput(format!("'{}' is not a key:value pair", pair))
            })?;
            if key.is_empty() {
                return Err(SyncError::InvalidInput(format!("'{}' has an empty key", pair)));
            }
            let value = value.trim().parse::<i64>().map_err(|_| {
                SyncError::InvalidInput(format!("value for '{}' is not an integer: '{}'", key, value))
            })?;
            Ok((key.to_string(), value))
        })
        .collect()
}

/// Expand an input into the statements that record it.
///
/// 1. append the raw input with the next event id,
/// 2. one `mutable` row per pair stamped with that event id,
/// 3. for [`WriteAuthority::Server`] only, drop older `mutable` rows for the
///    same player and key.
pub fn plan_input(
    input: &str,
    player_id: i64,
    authority: WriteAuthority,
) -> SyncResult<Vec<PlannedStatement>> {
    let pairs = parse_input(input)?;
    if pairs.is_empty() {
        return Ok(Vec::new());
    }

    let mut plan = Vec::with_capacity(1 + pairs.len() * 2);
    plan.push(PlannedStatement {
        sql: INSERT_INPUT.to_string(),
        params: vec![SqlValue::from(input), SqlValue::Integer(player_id)],
    });

    for (key, value) in pairs {
        plan.push(PlannedStatement {
            sql: INSERT_MUTATION.to_string(),
            params: vec![
                SqlValue::Text(key.clone()),
                SqlValue::Integer(value),
                SqlValue::Integer(player_id),
            ],
        });
        if authority == WriteAuthority::Server {
            plan.push(PlannedStatement {
                sql: PRUNE_MUTATIONS.to_string(),
                params: vec![SqlValue::Integer(player_id), SqlValue::Text(key)],
            });
        }
    }
    Ok(plan)
}

/// DDL for the demo tables.
pub fn schema_sql() -> &'static str {
    "CREATE TABLE IF NOT EXISTS input (
        input VARCHAR(255) NOT NULL,
        player_id INTEGER NOT NULL,
        event_id INTEGER NOT NULL,
        PRIMARY KEY (player_id, event_id)
    );
    CREATE TABLE IF NOT EXISTS mutable (
        key TEXT NOT NULL,
        val INTEGER NOT NULL,
        player_id INTEGER NOT NULL,
        event_id INTEGER NOT NULL,
        PRIMARY KEY (player_id, event_id, key)
    );"
}

/// Starting state for players 0 and 1.
pub fn seed_sql() -> &'static str {
    "INSERT INTO input (input, player_id, event_id) VALUES
        ('health:100|xp:0|mana:100', 0, 0),
        ('health:100|xp:0|mana:100', 1, 0);
    INSERT INTO mutable (key, val, player_id, event_id) VALUES
        ('health', 100, 0, 0),
        ('mana', 100, 0, 0),
        ('xp', 0, 0, 0),
        ('health', 100, 1, 0),
        ('mana', 100, 1, 0),
        ('xp', 0, 1, 0);"
}
