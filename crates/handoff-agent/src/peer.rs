//! HTTP transport to the peer agent.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::io::ReaderStream;

use crate::error::AgentError;
use crate::wire::{ShadowTrafficMessage, SlaveStartMigrationMessage};

/// Outbound messages the orchestrator and shadow plane send to a peer
/// agent. `destination` is the peer's `host:port`.
#[async_trait]
pub trait MigrationTransport: Send + Sync {
    /// Announce an inbound migration (`/SlaveStartMigration`).
    async fn slave_start(
        &self,
        destination: &str,
        msg: &SlaveStartMigrationMessage,
    ) -> Result<(), AgentError>;

    /// Mirror one captured frame (`/ForwardTraffic`).
    async fn forward_traffic(
        &self,
        destination: &str,
        msg: &ShadowTrafficMessage,
    ) -> Result<(), AgentError>;

    /// Stream the checkpoint archive (`/Checkpoints?pid=<pid>`).
    async fn send_checkpoint(
        &self,
        destination: &str,
        pid: i32,
        archive: &Path,
    ) -> Result<(), AgentError>;
}

/// Production transport over plain HTTP.
pub struct HttpPeerClient {
    http: reqwest::Client,
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MigrationTransport for HttpPeerClient {
    async fn slave_start(
        &self,
        destination: &str,
        msg: &SlaveStartMigrationMessage,
    ) -> Result<(), AgentError> {
        self.http
            .post(format!("http://{destination}/SlaveStartMigration"))
            .json(msg)
            .send()
            .await
            .map_err(AgentError::transport)?;
        Ok(())
    }

    async fn forward_traffic(
        &self,
        destination: &str,
        msg: &ShadowTrafficMessage,
    ) -> Result<(), AgentError> {
        self.http
            .post(format!("http://{destination}/ForwardTraffic"))
            .json(msg)
            .send()
            .await
            .map_err(AgentError::transport)?;
        Ok(())
    }

    async fn send_checkpoint(
        &self,
        destination: &str,
        pid: i32,
        archive: &Path,
    ) -> Result<(), AgentError> {
        let file = tokio::fs::File::open(archive)
            .await
            .map_err(AgentError::transport)?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        // Delivery is one-shot: the response status is not acted upon.
        let response = self
            .http
            .post(format!("http://{destination}/Checkpoints?pid={pid}"))
            .header(reqwest::header::CONTENT_TYPE, "binary/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(AgentError::transport)?;
        if !response.status().is_success() {
            tracing::warn!(
                "checkpoint for {pid} was not accepted by {destination}: {}",
                response.status()
            );
        }
        Ok(())
    }
}
