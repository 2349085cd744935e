//! Backup projection uploads and the shared retrying HTTP client.
//!
//! The projection is a single JSON blob of the most recent events, written to
//! a blob backend so read clients can keep functioning when the engine is
//! unreachable. Uploads are fire-and-forget with their own deadline; failures
//! are logged and never surfaced to the request that triggered them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::json;

use crate::model::Event;

/// Upper bound on events in one projection blob.
pub const PROJECTION_LIMIT: usize = 1000;
/// Deadline for one upload attempt.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared `reqwest` client with transient-error retry middleware.
pub fn retry_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    ClientBuilder::new(reqwest::Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

pub struct BackupUploader {
    client: ClientWithMiddleware,
    url: Option<String>,
}

impl BackupUploader {
    /// `url` is the blob destination for `events.json`; `None` disables
    /// uploads entirely.
    pub fn new(url: Option<String>) -> Self {
        Self { client: retry_client(), url }
    }

    pub fn enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Fire-and-forget upload of the projection. Returns immediately.
    pub fn spawn_upload(self: Arc<Self>, events: Vec<Event>) {
        if self.url.is_none() {
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = self.upload(events).await {
                log::warn!("backup projection upload failed: {e}");
            }
        });
    }

    async fn upload(&self, mut events: Vec<Event>) -> anyhow::Result<()> {
        let Some(url) = &self.url else {
            return Ok(());
        };
        events.truncate(PROJECTION_LIMIT);
        let body = json!({
            "lastUpdated": Utc::now(),
            "events": events,
        });
        let response = self
            .client
            .put(url)
            .header("Content-Type", "application/json")
            .header("Cache-Control", "public, max-age=60")
            .timeout(UPLOAD_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        response.error_for_status()?;
        log::debug!("backup projection uploaded to {url}");
        Ok(())
    }
}
