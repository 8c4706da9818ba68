//! Wire transports for upstream MCP servers

mod http;
mod pending;
mod sse;
mod stdio;

pub use http::{parse_response_body, StreamableHttpTransport};
pub use pending::{PendingRequests, PendingResponse};
pub use sse::SseTransport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::client::McpResult;
use super::types::{JsonRpcRequest, JsonRpcResponse};

/// A bidirectional JSON-RPC channel to one upstream server.
///
/// Implementations do not apply timeouts; the caller races `request` against its own deadline.
/// Dropping an in-flight `request` future must release whatever it registered.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response carrying the same id
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()>;

    /// `notifications/progress` params pushed by the server, when the transport can see them
    fn progress(&self) -> Option<broadcast::Receiver<Value>> {
        None
    }

    /// Cancelled once the transport is unusable (process exit, stream end, explicit close)
    fn closed(&self) -> CancellationToken;

    async fn close(&self);
}
