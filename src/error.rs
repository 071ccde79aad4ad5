// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Separates transport, protocol, schema and materialization failures

use thiserror::Error;

/// Result type for sync engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the fetchers, the materializer and the local store.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The change-log service could not be reached or answered with status >= 400.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// HTTP status when the server answered at all.
        status: Option<u16>,
        retryable: bool,
    },

    /// The response body or headers could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A relation was seen before its column schema was learned.
    #[error("column schema for table '{table}' is not known")]
    SchemaMissing { table: String },

    /// Applying a remote transaction to the local store failed.
    #[error("failed to materialize transaction {txid}: {source}")]
    Materialization {
        txid: u64,
        /// Transactions committed earlier in the same call.
        committed: Vec<u64>,
        #[source]
        source: Box<SyncError>,
    },

    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Build a transport error from a reqwest failure.
    ///
    /// Timeouts and connection failures are retryable; anything else is not.
    pub fn from_request(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        SyncError::Transport {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
            retryable,
        }
    }

    /// Build a transport error from an HTTP status >= 400.
    pub fn from_status(status: u16, body: &str) -> Self {
        let retryable = status == 429 || status >= 500;
        SyncError::Transport {
            message: format!("server answered {}: {}", status, body.trim()),
            status: Some(status),
            retryable,
        }
    }

    /// Returns true if the failed operation may succeed when simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport {
                retryable: true,
                ..
            }
        )
    }
}
