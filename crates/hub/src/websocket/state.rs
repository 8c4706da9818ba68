//! Registry of open local sessions

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;

/// All open local sessions, shared across handlers
#[derive(Clone, Default)]
pub struct SessionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection
    pub async fn add_connection(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let mut connections = self.connections.write().await;
        connections.insert(conn.session_id, Arc::clone(&conn));

        tracing::info!(
            session_id = %conn.session_id,
            scope = ?conn.scope_key,
            total_connections = connections.len(),
            "Local session opened"
        );

        conn
    }

    /// Remove a connection
    pub async fn remove_connection(&self, session_id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(session_id).is_some() {
            tracing::info!(
                session_id = %session_id,
                remaining_connections = connections.len(),
                "Local session closed"
            );
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Queue `frame` on every session; returns how many accepted it
    pub async fn broadcast(&self, frame: &str) -> usize {
        let connections = self.connections.read().await;
        connections.values().filter(|c| c.send(frame)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_add_and_remove_connection() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn = registry.add_connection(Connection::new(None, tx)).await;
        assert_eq!(registry.connection_count().await, 1);

        registry.remove_connection(&conn.session_id).await;
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_sessions() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        registry.add_connection(Connection::new(None, tx1)).await;
        registry.add_connection(Connection::new(Some("$smart".into()), tx2)).await;
        drop(rx2);

        assert_eq!(registry.broadcast("ping").await, 1);
        assert_eq!(rx1.recv().await.as_deref(), Some("ping"));
    }
}
