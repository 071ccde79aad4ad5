// ABOUTME: Change fetcher - polls the change-log service for one shape
// ABOUTME: Tracks the pagination cursor, shape handle and catch-up/live mode

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::aggregator::TransactionBuffer;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    decode_events, HANDLE_HEADER, INITIAL_OFFSET, OFFSET_HEADER, SCHEMA_HEADER,
    UP_TO_DATE_HEADER,
};
use crate::schema::{SchemaCache, TableSchema};
use crate::shape::ShapeDescriptor;

/// Whether a fetcher drives the materialization snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherRole {
    /// Polled first each cycle; may enter live (long-poll) mode.
    Primary,
    /// Polled concurrently after the primary; always does bounded catch-up polls.
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    CatchingUp,
    Live,
}

/// Per-shape mutable position in the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherCursor {
    /// Opaque continuation token from the service.
    pub offset: String,
    /// Shape handle, fixed once first observed.
    pub handle: Option<String>,
    pub mode: FetchMode,
}

impl Default for FetcherCursor {
    fn default() -> Self {
        Self {
            offset: INITIAL_OFFSET.to_string(),
            handle: None,
            mode: FetchMode::CatchingUp,
        }
    }
}

impl FetcherCursor {
    pub fn is_live(&self) -> bool {
        self.mode == FetchMode::Live
    }

    /// Record the handle from a response; later values are ignored.
    pub fn observe_handle(&mut self, handle: Option<String>) {
        if self.handle.is_none() {
            self.handle = handle;
        }
    }

    /// Apply the single mode transition rule.
    ///
    /// A primary moves to `Live` once the service reports it caught up and
    /// stays there. A secondary never leaves `CatchingUp`.
    pub fn transition(&mut self, role: FetcherRole, caught_up: bool) {
        self.mode = match (role, self.mode, caught_up) {
            (FetcherRole::Secondary, _, _) => FetchMode::CatchingUp,
            (FetcherRole::Primary, FetchMode::Live, _) => FetchMode::Live,
            (FetcherRole::Primary, FetchMode::CatchingUp, true) => FetchMode::Live,
            (FetcherRole::Primary, FetchMode::CatchingUp, false) => FetchMode::CatchingUp,
        };
    }
}

/// What a single poll observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Change events appended to the aggregator.
    pub events: usize,
    /// The response carried the up-to-date marker.
    pub caught_up: bool,
    /// The service answered 204.
    pub no_content: bool,
    /// A malformed response was logged and treated as an empty poll.
    pub discarded: bool,
    /// Cursor offset after the poll.
    pub offset: String,
}

/// Polls one shape and feeds its change events into the shared aggregator.
///
/// A fetcher must not be polled concurrently with itself (`poll` takes
/// `&mut self`), which keeps per-key event order equal to arrival order.
pub struct ChangeFetcher {
    shape: ShapeDescriptor,
    role: FetcherRole,
    cursor: FetcherCursor,
    base_url: Url,
    client: Client,
    schemas: SchemaCache,
    buffer: TransactionBuffer,
    caught_up: bool,
    last_poll_at: Option<DateTime<Utc>>,
}

impl ChangeFetcher {
    pub fn new(
        shape: ShapeDescriptor,
        role: FetcherRole,
        base_url: &str,
        client: Client,
        schemas: SchemaCache,
        buffer: TransactionBuffer,
    ) -> SyncResult<Self> {
        shape.validate()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("invalid shape url '{}': {}", base_url, e)))?;
        Ok(Self {
            shape,
            role,
            cursor: FetcherCursor::default(),
            base_url,
            client,
            schemas,
            buffer,
            caught_up: false,
            last_poll_at: None,
        })
    }

    pub fn shape(&self) -> &ShapeDescriptor {
        &self.shape
    }

    pub fn role(&self) -> FetcherRole {
        self.role
    }

    pub fn cursor(&self) -> &FetcherCursor {
        &self.cursor
    }

    /// Whether the last accepted response carried the up-to-date marker.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up
    }

    pub fn last_poll_at(&self) -> Option<DateTime<Utc>> {
        self.last_poll_at
    }

    /// Build the request URL for the current cursor.
    pub fn request_url(&self) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("table", &self.shape.table)
                .append_pair("offset", &self.cursor.offset)
                .append_pair("live", if self.cursor.is_live() { "true" } else { "false" });
            if let Some(predicate) = self.shape.where_clause() {
                query.append_pair("where", &predicate);
            }
            if let Some(handle) = &self.cursor.handle {
                query.append_pair("handle", handle);
            }
        }
        url
    }

    /// Fetch the next page of the shape log.
    ///
    /// Transport failures (including status >= 400) and a missing schema for
    /// an unknown table are returned as errors, leaving the cursor where it
    /// was. Malformed responses are logged and reported as an empty poll.
    pub async fn poll(&mut self) -> SyncResult<PollOutcome> {
        let url = self.request_url();
        tracing::debug!(
            table = %self.shape.table,
            offset = %self.cursor.offset,
            live = self.cursor.is_live(),
            "Polling shape"
        );

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(SyncError::from_request)?;
        self.last_poll_at = Some(Utc::now());

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), &body));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let schema_header = header(SCHEMA_HEADER);
        let offset = header(OFFSET_HEADER);
        let handle = header(HANDLE_HEADER);
        let caught_up = response.headers().contains_key(UP_TO_DATE_HEADER);

        let table = self.shape.table.clone();
        if !self.schemas.contains(&table) {
            let Some(raw) = schema_header else {
                return Err(SyncError::SchemaMissing { table });
            };
            match TableSchema::from_header(&raw) {
                Ok(schema) => {
                    self.schemas.insert_if_absent(&table, schema);
                    tracing::info!("Learned column schema for {}", table);
                }
                Err(e) => {
                    tracing::warn!("Discarding response for {}: {}", table, e);
                    return Ok(self.discarded_outcome());
                }
            }
        }

        let Some(offset) = offset else {
            tracing::warn!(
                "Discarding response for {}: missing {} header",
                table,
                OFFSET_HEADER
            );
            return Ok(self.discarded_outcome());
        };

        // Read the body before touching the cursor so a dropped connection
        // leaves the position unchanged.
        let body = if status == StatusCode::NO_CONTENT {
            None
        } else {
            Some(response.bytes().await.map_err(SyncError::from_request)?)
        };

        self.cursor.offset = offset;
        self.cursor.observe_handle(handle);
        self.caught_up = caught_up;
        let was_live = self.cursor.is_live();
        self.cursor.transition(self.role, caught_up);
        if !was_live && self.cursor.is_live() {
            tracing::info!("Shape {} caught up, switching to live polling", self.shape);
        }

        let mut outcome = PollOutcome {
            caught_up,
            offset: self.cursor.offset.clone(),
            ..PollOutcome::default()
        };

        let Some(body) = body else {
            outcome.no_content = true;
            return Ok(outcome);
        };

        match decode_events(&body, &table) {
            Ok(events) => {
                outcome.events = events.len();
                self.buffer.extend(events);
            }
            Err(e) => {
                tracing::warn!("updater error for {}: {}", table, e);
                outcome.discarded = true;
            }
        }

        tracing::debug!(
            table = %table,
            events = outcome.events,
            offset = %self.cursor.offset,
            "Poll complete"
        );
        Ok(outcome)
    }

    fn discarded_outcome(&self) -> PollOutcome {
        PollOutcome {
            discarded: true,
            offset: self.cursor.offset.clone(),
            ..PollOutcome::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::FilterValue;

    fn fetcher(role: FetcherRole) -> ChangeFetcher {
        let shape = ShapeDescriptor::new("mutable").with_filter("player_id", FilterValue::Integer(0));
        ChangeFetcher::new(
            shape,
            role,
            "http://localhost:3000/v1/shape",
            Client::new(),
            SchemaCache::new(),
            TransactionBuffer::new(),
        )
        .unwrap()
    }

    fn query_value(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_initial_request_url() {
        let f = fetcher(FetcherRole::Primary);
        let url = f.request_url();
        assert_eq!(url.path(), "/v1/shape");
        assert_eq!(query_value(&url, "table").as_deref(), Some("mutable"));
        assert_eq!(query_value(&url, "offset").as_deref(), Some("-1"));
        assert_eq!(query_value(&url, "live").as_deref(), Some("false"));
        assert_eq!(query_value(&url, "where").as_deref(), Some("player_id=0"));
        assert_eq!(query_value(&url, "handle"), None);
    }

    #[test]
    fn test_request_url_after_progress() {
        let mut f = fetcher(FetcherRole::Primary);
        f.cursor.offset = "0_12".into();
        f.cursor.observe_handle(Some("h-1".into()));
        f.cursor.transition(FetcherRole::Primary, true);
        let url = f.request_url();
        assert_eq!(query_value(&url, "offset").as_deref(), Some("0_12"));
        assert_eq!(query_value(&url, "live").as_deref(), Some("true"));
        assert_eq!(query_value(&url, "handle").as_deref(), Some("h-1"));
    }

    #[test]
    fn test_handle_is_fixed_once_observed() {
        let mut cursor = FetcherCursor::default();
        cursor.observe_handle(None);
        assert_eq!(cursor.handle, None);
        cursor.observe_handle(Some("first".into()));
        cursor.observe_handle(Some("second".into()));
        assert_eq!(cursor.handle.as_deref(), Some("first"));
    }

    #[test]
    fn test_primary_goes_live_and_stays_live() {
        let mut cursor = FetcherCursor::default();
        cursor.transition(FetcherRole::Primary, false);
        assert_eq!(cursor.mode, FetchMode::CatchingUp);
        cursor.transition(FetcherRole::Primary, true);
        assert_eq!(cursor.mode, FetchMode::Live);
        cursor.transition(FetcherRole::Primary, false);
        assert_eq!(cursor.mode, FetchMode::Live);
    }

    #[test]
    fn test_secondary_never_goes_live() {
        let mut cursor = FetcherCursor::default();
        cursor.transition(FetcherRole::Secondary, true);
        assert_eq!(cursor.mode, FetchMode::CatchingUp);
        cursor.transition(FetcherRole::Secondary, true);
        assert!(!cursor.is_live());
    }

    #[test]
    fn test_rejects_invalid_shape_and_url() {
        let bad_shape = ChangeFetcher::new(
            ShapeDescriptor::new("no such;table"),
            FetcherRole::Secondary,
            "http://localhost:3000/v1/shape",
            Client::new(),
            SchemaCache::new(),
            TransactionBuffer::new(),
        );
        assert!(bad_shape.is_err());

        let bad_url = ChangeFetcher::new(
            ShapeDescriptor::new("input"),
            FetcherRole::Secondary,
            "not a url",
            Client::new(),
            SchemaCache::new(),
            TransactionBuffer::new(),
        );
        assert!(matches!(bad_url, Err(SyncError::Config(_))));
    }
}
