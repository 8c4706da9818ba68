//! Local WebSocket session
//!
//! Represents one downstream MCP client connected over `/ws`.

use tokio::sync::mpsc;
use uuid::Uuid;

/// Represents an active local session
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Routing key from the URL (`/ws/{group}`), if any
    pub scope_key: Option<String>,

    /// Serialized JSON-RPC frames waiting to be written to this connection
    pub sender: mpsc::UnboundedSender<String>,
}

impl Connection {
    pub fn new(scope_key: Option<String>, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope_key,
            sender,
        }
    }

    /// Queue a frame. Returns false once the connection is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.sender.send(frame.into()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_until_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(Some("g1".to_string()), tx);

        assert!(conn.send("hello"));
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        drop(rx);
        assert!(!conn.send("late"));
    }
}
