//! In-flight request bookkeeping for transports that receive responses out of band

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};

use crate::mcp::client::{McpClientError, McpResult};
use crate::mcp::types::{JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};

type Waiter = oneshot::Sender<McpResult<JsonRpcResponse>>;

/// Maps request ids to the tasks waiting for them
pub struct PendingRequests {
    backend: String,
    waiters: Mutex<HashMap<i64, Waiter>>,
    progress: broadcast::Sender<Value>,
}

impl PendingRequests {
    pub fn new(backend: impl Into<String>) -> Arc<Self> {
        let (progress, _) = broadcast::channel(64);
        Arc::new(Self {
            backend: backend.into(),
            waiters: Mutex::new(HashMap::new()),
            progress,
        })
    }

    /// Reserve a slot for `id`. The slot is released when the returned handle is dropped.
    pub fn register(self: &Arc<Self>, id: i64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(id, tx);
        }
        PendingResponse {
            id,
            rx,
            pending: Arc::clone(self),
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<Value> {
        self.progress.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn release(&self, id: i64) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&id);
        }
    }

    fn resolve(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_ref().and_then(JsonRpcId::as_i64) else {
            tracing::debug!(backend = %self.backend, "Dropping response without numeric id");
            return;
        };
        let waiter = self.waiters.lock().ok().and_then(|mut w| w.remove(&id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => tracing::debug!(backend = %self.backend, id, "Response for unknown request"),
        }
    }

    /// Fail every waiter, e.g. when the underlying process or stream is gone
    pub fn fail_all(&self) {
        let drained: Vec<Waiter> = match self.waiters.lock() {
            Ok(mut waiters) => waiters.drain().map(|(_, tx)| tx).collect(),
            Err(_) => return,
        };
        for tx in drained {
            let _ = tx.send(Err(McpClientError::Closed));
        }
    }

    /// Handle one inbound frame.
    ///
    /// Returns a response when the server sent a request of its own that must be answered.
    pub fn route(&self, frame: &str) -> Option<JsonRpcResponse> {
        let message: JsonRpcMessage = match serde_json::from_str(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(backend = %self.backend, error = %e, "Ignoring non JSON-RPC frame");
                return None;
            }
        };

        match message {
            JsonRpcMessage::Response(response) => {
                self.resolve(response);
                None
            }
            JsonRpcMessage::Request(request) if request.is_notification() => {
                self.notification(request);
                None
            }
            JsonRpcMessage::Request(request) => Some(self.server_request(request)),
        }
    }

    fn notification(&self, notification: JsonRpcRequest) {
        match notification.method.as_str() {
            "notifications/progress" => {
                let _ = self.progress.send(notification.params.unwrap_or(Value::Null));
            }
            method => tracing::debug!(backend = %self.backend, method, "Upstream notification"),
        }
    }

    fn server_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            method => {
                tracing::debug!(backend = %self.backend, method, "Unsupported server request");
                JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(method))
            }
        }
    }
}

/// Handle for one registered request
pub struct PendingResponse {
    id: i64,
    rx: oneshot::Receiver<McpResult<JsonRpcResponse>>,
    pending: Arc<PendingRequests>,
}

impl PendingResponse {
    pub async fn wait(mut self) -> McpResult<JsonRpcResponse> {
        (&mut self.rx).await.map_err(|_| McpClientError::Closed)?
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.release(self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_reaches_matching_waiter() {
        let pending = PendingRequests::new("fetch");
        let first = pending.register(1);
        let second = pending.register(2);

        assert!(pending
            .route(r#"{"jsonrpc":"2.0","id":2,"result":{"ok":2}}"#)
            .is_none());
        assert!(pending
            .route(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":1}}"#)
            .is_none());

        assert_eq!(first.wait().await.unwrap().result, Some(json!({"ok": 1})));
        assert_eq!(second.wait().await.unwrap().result, Some(json!({"ok": 2})));
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_slot() {
        let pending = PendingRequests::new("fetch");
        let handle = pending.register(7);
        assert_eq!(pending.in_flight(), 1);
        drop(handle);
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_reports_closed() {
        let pending = PendingRequests::new("fetch");
        let handle = pending.register(3);
        pending.fail_all();
        assert!(matches!(handle.wait().await, Err(McpClientError::Closed)));
    }

    #[test]
    fn test_server_ping_is_answered() {
        let pending = PendingRequests::new("fetch");
        let reply = pending
            .route(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#)
            .unwrap();
        assert_eq!(reply.result, Some(json!({})));
        assert_eq!(reply.id, Some(JsonRpcId::String("srv-1".into())));
    }

    #[test]
    fn test_progress_notification_is_broadcast() {
        let pending = PendingRequests::new("fetch");
        let mut rx = pending.subscribe_progress();
        assert!(pending
            .route(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":4,"progress":1}}"#)
            .is_none());
        assert_eq!(rx.try_recv().unwrap()["progressToken"], 4);
    }
}
