//! Legacy HTTP+SSE transport.
//!
//! The server streams JSON-RPC messages over a long-lived GET. Its first event is
//! `endpoint`, carrying the URL (usually relative) that requests must be POSTed to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{PendingRequests, Transport};
use crate::mcp::client::{McpClientError, McpResult};
use crate::mcp::types::{JsonRpcId, JsonRpcRequest, JsonRpcResponse};

pub struct SseTransport {
    backend: String,
    http: reqwest::Client,
    post_url: Url,
    headers: HeaderMap,
    pending: Arc<PendingRequests>,
    closed: CancellationToken,
}

fn stream_error(error: reqwest_eventsource::Error) -> McpClientError {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => McpClientError::HttpStatus {
            status: status.as_u16(),
            body: String::new(),
        },
        other => McpClientError::Stream(other.to_string()),
    }
}

/// Resolve the `endpoint` event payload against the stream URL
pub fn resolve_endpoint(stream_url: &str, endpoint: &str) -> McpResult<Url> {
    let base = Url::parse(stream_url)
        .map_err(|e| McpClientError::Configuration(format!("invalid SSE url {}: {}", stream_url, e)))?;
    base.join(endpoint.trim())
        .map_err(|e| McpClientError::Stream(format!("invalid endpoint event {}: {}", endpoint, e)))
}

impl SseTransport {
    /// Open the event stream and wait (up to `handshake`) for the endpoint event
    pub async fn connect(
        backend: &str,
        http: reqwest::Client,
        url: &str,
        headers: HeaderMap,
        handshake: Duration,
    ) -> McpResult<Self> {
        let request = http
            .get(url)
            .headers(headers.clone())
            .header("Accept", "text/event-stream");
        let mut source =
            EventSource::new(request).map_err(|e| McpClientError::Stream(e.to_string()))?;
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        let endpoint = tokio::time::timeout(handshake, async {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(message)) if message.event == "endpoint" => {
                        return Ok(message.data);
                    }
                    Ok(Event::Message(message)) => {
                        tracing::debug!(backend = %backend, event = %message.event, "Event before endpoint");
                    }
                    Err(e) => return Err(stream_error(e)),
                }
            }
            Err(McpClientError::Closed)
        })
        .await
        .map_err(|_| McpClientError::Timeout)?;

        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                source.close();
                return Err(e);
            }
        };
        let post_url = resolve_endpoint(url, &endpoint)?;
        tracing::info!(backend = %backend, endpoint = %post_url, "SSE stream open");

        let pending = PendingRequests::new(backend);
        let closed = CancellationToken::new();

        let transport = Self {
            backend: backend.to_string(),
            http,
            post_url,
            headers,
            pending,
            closed,
        };
        transport.spawn_reader(source);
        Ok(transport)
    }

    fn spawn_reader(&self, mut source: EventSource) {
        let backend = self.backend.clone();
        let pending = Arc::clone(&self.pending);
        let closed = self.closed.clone();
        let http = self.http.clone();
        let post_url = self.post_url.clone();
        let headers = self.headers.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    event = source.next() => match event {
                        Some(Ok(Event::Message(message))) if message.event == "message" || message.event.is_empty() => {
                            if let Some(reply) = pending.route(&message.data) {
                                let posted = http
                                    .post(post_url.clone())
                                    .headers(headers.clone())
                                    .json(&reply)
                                    .send()
                                    .await;
                                if let Err(e) = posted {
                                    tracing::warn!(backend = %backend, error = %e, "Failed to answer server request");
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(backend = %backend, error = %e, "SSE stream failed");
                            break;
                        }
                        None => {
                            tracing::info!(backend = %backend, "SSE stream ended");
                            break;
                        }
                    }
                }
            }
            source.close();
            closed.cancel();
            pending.fail_all();
        });
    }

    async fn post(&self, body: &JsonRpcRequest) -> McpResult<()> {
        let response = self
            .http
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if self.closed.is_cancelled() {
            return Err(McpClientError::Closed);
        }
        let id = request
            .id
            .as_ref()
            .and_then(JsonRpcId::as_i64)
            .ok_or(McpClientError::InvalidResponse)?;

        let waiter = self.pending.register(id);
        self.post(&request).await?;
        waiter.wait().await
    }

    async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()> {
        self.post(&notification).await
    }

    fn progress(&self) -> Option<broadcast::Receiver<Value>> {
        Some(self.pending.subscribe_progress())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        tracing::debug!(backend = %self.backend, "Closing SSE transport");
        self.closed.cancel();
        self.pending.fail_all();
    }
}
