//! Stream presence notifications
//!
//! Tells the backend when a broadcast starts or stops so it can be listed.
//! Calls are fire-and-forget from the stream's point of view.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::types::PeerId;
use crate::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceNotifier: Send + Sync {
    async fn notify_stream_started(&self, peer_id: &PeerId, display_name: &str) -> Result<()>;

    async fn notify_stream_stopped(&self, peer_id: &PeerId) -> Result<()>;
}

/// Used when no presence backend is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPresenceNotifier;

#[async_trait]
impl PresenceNotifier for NoopPresenceNotifier {
    async fn notify_stream_started(&self, _peer_id: &PeerId, _display_name: &str) -> Result<()> {
        Ok(())
    }

    async fn notify_stream_stopped(&self, _peer_id: &PeerId) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct StreamStarted<'a> {
    peer_id: &'a PeerId,
    display_name: &'a str,
}

#[derive(Serialize)]
struct StreamStopped<'a> {
    peer_id: &'a PeerId,
}

/// POSTs to `{endpoint}/streams/started` and `{endpoint}/streams/stopped`
pub struct HttpPresenceNotifier {
    http_client: Client,
    endpoint: String,
}

impl HttpPresenceNotifier {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http_client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{path}", self.endpoint);
        self.http_client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        debug!(url = %url, "Presence notification sent");
        Ok(())
    }
}

#[async_trait]
impl PresenceNotifier for HttpPresenceNotifier {
    async fn notify_stream_started(&self, peer_id: &PeerId, display_name: &str) -> Result<()> {
        self.post(
            "/streams/started",
            &StreamStarted {
                peer_id,
                display_name,
            },
        )
        .await
    }

    async fn notify_stream_stopped(&self, peer_id: &PeerId) -> Result<()> {
        self.post("/streams/stopped", &StreamStopped { peer_id }).await
    }
}
