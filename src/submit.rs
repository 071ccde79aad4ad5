// ABOUTME: HTTP client for the input submission endpoint
// ABOUTME: Posts queued inputs and clears the outbox once the server accepts them

use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::outbox::Outbox;

#[derive(Clone)]
pub struct SubmitClient {
    client: Client,
    url: Url,
}

impl SubmitClient {
    pub fn new(url: &str, timeout: Duration) -> SyncResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| SyncError::Config(format!("invalid submit url '{}': {}", url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SyncError::from_request)?;
        Ok(Self { client, url })
    }

    /// POST the inputs as a JSON array of strings.
    pub async fn submit(&self, inputs: &[String]) -> SyncResult<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(inputs)
            .send()
            .await
            .map_err(SyncError::from_request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), &body));
        }
        tracing::debug!("Submitted {} input(s) to {}", inputs.len(), self.url);
        Ok(())
    }
}

/// Submit every queued input in one request and clear the outbox on success.
///
/// Returns the number of inputs submitted. On failure the outbox is kept so
/// the batch can be retried or discarded.
pub async fn submit_pending(client: &SubmitClient, outbox: &Outbox) -> SyncResult<usize> {
    let pending: Vec<String> = outbox
        .pending_inputs()?
        .into_iter()
        .map(|staged| staged.input)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }

    client.submit(&pending).await?;
    outbox.clear_pending()?;
    tracing::info!("Submitted {} pending input(s)", pending.len());
    Ok(pending.len())
}
