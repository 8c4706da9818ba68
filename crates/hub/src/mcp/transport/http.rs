//! Streamable HTTP transport: every message is a POST, the session travels in a header

use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::mcp::client::{McpClientError, McpResult};
use crate::mcp::types::{JsonRpcId, JsonRpcRequest, JsonRpcResponse};

const SESSION_HEADER: &str = "mcp-session-id";

/// Parse a POST response body that is either plain JSON or SSE-framed.
///
/// SSE bodies may carry notifications before the answer; the frame whose id
/// matches `expected` wins, falling back to the last parseable response.
pub fn parse_response_body(body: &str, expected: Option<&JsonRpcId>) -> McpResult<JsonRpcResponse> {
    let trimmed = body.trim();

    if trimmed.starts_with("event:") || trimmed.starts_with("data:") || trimmed.starts_with("id:") {
        let mut last: Option<JsonRpcResponse> = None;
        for line in trimmed.lines() {
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(data.trim()) else {
                continue;
            };
            if parsed.result.is_none() && parsed.error.is_none() {
                continue;
            }
            if expected.is_some() && parsed.id.as_ref() == expected {
                return Ok(parsed);
            }
            last = Some(parsed);
        }
        return last.ok_or(McpClientError::InvalidResponse);
    }

    serde_json::from_str(trimmed).map_err(McpClientError::from)
}

pub struct StreamableHttpTransport {
    backend: String,
    http: reqwest::Client,
    url: String,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    closed: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(backend: &str, http: reqwest::Client, url: &str, headers: HeaderMap) -> Self {
        Self {
            backend: backend.to_string(),
            http,
            url: url.to_string(),
            headers,
            session_id: RwLock::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|s| s.clone())
    }

    async fn post(&self, body: &JsonRpcRequest) -> McpResult<reqwest::Response> {
        if self.closed.is_cancelled() {
            return Err(McpClientError::Closed);
        }

        let mut builder = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");

        if let Some(session_id) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session_id);
        }

        let response = builder.json(body).send().await?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut current) = self.session_id.write() {
                if current.as_deref() != Some(session_id) {
                    tracing::debug!(backend = %self.backend, session_id, "Upstream session assigned");
                    *current = Some(session_id.to_string());
                }
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(backend = %self.backend, error = %e, "Failed to read error response body");
                    String::new()
                }
            };
            return Err(McpClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let response = self.post(&request).await?;
        let body = response.text().await?;
        parse_response_body(&body, request.id.as_ref())
    }

    async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()> {
        self.post(&notification).await.map(|_| ())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        // Best-effort session termination
        if let Some(session_id) = self.session_id() {
            let result = self
                .http
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session_id)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(backend = %self.backend, error = %e, "Session DELETE failed");
            }
        }
    }
}
