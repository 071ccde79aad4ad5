// ABOUTME: Utility functions for identifier validation, quoting and retries
// ABOUTME: Provides SQL quoting helpers and the exponential backoff policy

use anyhow::{anyhow, Result};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Validate a SQL identifier (table or column name) before it is interpolated.
///
/// Identifiers must start with a letter or underscore, contain only ASCII
/// alphanumerics or underscores, and be at most 63 characters long.
///
/// # Examples
///
/// ```
/// # use shape_sync::utils::validate_identifier;
/// assert!(validate_identifier("player_id").is_ok());
/// assert!(validate_identifier("input; DROP TABLE input").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> SyncResult<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidInput(
            "Identifier cannot be empty or whitespace-only".to_string(),
        ));
    }

    if trimmed.len() > 63 {
        return Err(SyncError::InvalidInput(format!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        )));
    }

    let mut chars = trimmed.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(SyncError::InvalidInput(format!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first
            )));
        }
    }

    if let Some(bad) = trimmed
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_')
    {
        return Err(SyncError::InvalidInput(format!(
            "Identifier '{}' contains invalid character '{}'",
            sanitize_identifier(trimmed),
            bad
        )));
    }

    Ok(())
}

/// Strip control characters and cap length so identifiers are safe to log.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote an identifier (table, column).
///
/// Assumes the identifier has already been validated. Escapes embedded quotes
/// and wraps the identifier in double quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a SQL string literal.
///
/// Only used for the shape `where` predicate, which the change-log service
/// parses itself; local statements always bind parameters instead.
///
/// ```
/// # use shape_sync::utils::quote_literal;
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// ```
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: PathBuf) -> Result<PathBuf> {
    let as_str = path.to_string_lossy();
    if let Some(stripped) = as_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        return Ok(home.join(stripped));
    }
    if as_str == "~" {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        return Ok(home);
    }
    Ok(path)
}

/// Exponential backoff with a cap and a small random jitter.
///
/// Each recorded failure doubles the delay, starting from `initial` and never
/// exceeding `max`. A success resets the policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.current_delay();
        let jitter_bound = (delay.as_millis() as u64) / 10;
        if jitter_bound == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_bound);
        delay + Duration::from_millis(jitter)
    }

    /// Record a failure that retrying will not fix; waits the capped delay.
    pub fn record_permanent_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.max
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay for the current failure count, without jitter.
    pub fn current_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        // 2^16 * initial is already far past any sensible cap
        let exponent = (self.consecutive_failures - 1).min(16);
        let delay = self.initial.saturating_mul(1u32 << exponent);
        delay.min(self.max)
    }
}

/// Retry an async operation, doubling `initial_delay` after each failure.
///
/// `max_retries` of 0 runs the operation once. Used where a peer may come up
/// after us (the submit server's database connection).
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                tracing::warn!(
                    "Attempt {}/{} failed: {:#}; retrying in {:?}",
                    attempt + 1,
                    max_retries + 1,
                    e,
                    delay
                );
                last_error = Some(e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("operation failed after {} attempt(s)", max_retries + 1)))
}
