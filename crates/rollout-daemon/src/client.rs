//! Update-check and ping exchanges with the server.
//!
//! One batched update-check request per cycle, one ping batch per
//! cycle. The trait is async so the orchestrator never blocks a
//! worker thread on the network; the HTTP implementation uses
//! `reqwest` with JSON bodies.

use async_trait::async_trait;
use rollout_core::protocol::{
    AppCheckResult, PingEvent, ProtocolError, ResponseEnvelope, UpdateCheckRequest,
};
use serde::Serialize;
use thiserror::Error;

/// Client-level failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Connection-level failure; eligible for one fallback retry.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// Non-success HTTP status from the server.
    #[error("server returned http status {0}")]
    Status(u16),

    /// The response violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server exchanges used by the orchestrator.
#[async_trait]
pub trait UpdateClient: Send + Sync {
    /// Send one batched update-check for `apps` under `request_id`.
    ///
    /// Returns one result per responding app; apps the server omitted
    /// are simply absent.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the exchange or response parsing
    /// fails as a whole. Per-app `error-*` statuses are carried in the
    /// results, not here.
    async fn check(
        &self,
        request_id: &str,
        apps: Vec<UpdateCheckRequest>,
    ) -> Result<Vec<AppCheckResult>, ClientError>;

    /// Send outcome pings under `request_id`. Fire-and-forget from the
    /// orchestrator's point of view; failures are logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the send fails.
    async fn ping(
        &self,
        request_id: &str,
        events: Vec<PingEvent>,
    ) -> Result<(), ClientError>;
}

#[derive(Serialize)]
struct RequestEnvelope<'a, T> {
    request: RequestBody<'a, T>,
}

#[derive(Serialize)]
struct RequestBody<'a, T> {
    protocol: &'static str,
    #[serde(rename = "requestid")]
    request_id: &'a str,
    apps: &'a [T],
}

const PROTOCOL_VERSION: &str = "4.0";

/// HTTP/JSON client.
pub struct HttpUpdateClient {
    http: reqwest::Client,
    update_url: String,
}

impl HttpUpdateClient {
    /// Client sending both exchanges to `update_url`.
    #[must_use]
    pub fn new(http: reqwest::Client, update_url: impl Into<String>) -> Self {
        Self {
            http,
            update_url: update_url.into(),
        }
    }

    async fn post<T: Serialize + Sync>(
        &self,
        request_id: &str,
        apps: &[T],
    ) -> Result<reqwest::Response, ClientError> {
        let body = RequestEnvelope {
            request: RequestBody {
                protocol: PROTOCOL_VERSION,
                request_id,
                apps,
            },
        };
        let response = self
            .http
            .post(&self.update_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ClientError::Transient(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl UpdateClient for HttpUpdateClient {
    async fn check(
        &self,
        request_id: &str,
        apps: Vec<UpdateCheckRequest>,
    ) -> Result<Vec<AppCheckResult>, ClientError> {
        tracing::debug!(request_id, apps = apps.len(), "update check");
        let response = self.post(request_id, &apps).await?;
        let envelope: ResponseEnvelope = response
            .json()
            .await
            .map_err(|err| ClientError::Protocol(ProtocolError::Malformed(err.to_string())))?;
        let mut results = Vec::with_capacity(envelope.response.apps.len());
        for app in envelope.response.apps {
            results.push(app.into_result()?);
        }
        Ok(results)
    }

    async fn ping(
        &self,
        request_id: &str,
        events: Vec<PingEvent>,
    ) -> Result<(), ClientError> {
        tracing::debug!(request_id, events = events.len(), "ping");
        self.post(request_id, &events).await?;
        Ok(())
    }
}
