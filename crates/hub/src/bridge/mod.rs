//! Endpoint Bridge
//!
//! Keeps one outbound WebSocket connection per enabled [`Endpoint`] record and
//! serves the catalog to whoever is on the other side.
//!
//! # Architecture
//!
//! - **Connection**: dial, serve, and reconnect one endpoint through its own
//!   [`ReconnectMachine`](crate::reconnect::ReconnectMachine)
//! - **Routing**: per-request choice between unscoped, group and smart scopes
//! - **Bridge**: the set of connections, kept in sync with the configuration

pub mod connection;
pub mod routing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mcphub_shared::{ConfigStore, Endpoint};

use crate::mcp::McpRequestHandler;
use crate::reconnect::ReconnectLimits;

pub use connection::{BridgeContext, EndpointConnection, EndpointStatus};

pub struct EndpointBridge {
    context: Arc<BridgeContext>,
    connections: Mutex<HashMap<String, Arc<EndpointConnection>>>,
}

impl EndpointBridge {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        handler: Arc<McpRequestHandler>,
        limits: ReconnectLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            context: Arc::new(BridgeContext {
                store,
                handler,
                limits,
            }),
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.context.store
    }

    fn get(&self, id: &str) -> Option<Arc<EndpointConnection>> {
        self.connections.lock().ok()?.get(id).cloned()
    }

    /// Apply the current record for `id`: connect, redial on URL change,
    /// disconnect when disabled (per record or globally), forget when deleted.
    pub fn sync_endpoint(&self, id: &str) {
        let Some(endpoint) = self.store().get_endpoint(id) else {
            self.remove_endpoint(id);
            return;
        };

        let bridge_enabled = self.store().system_settings().endpoints.enabled;
        if !endpoint.enabled || !bridge_enabled {
            if let Some(connection) = self.get(id) {
                connection.close();
            }
            return;
        }

        match self.get(id) {
            Some(connection) => {
                if connection.update(&endpoint) {
                    tracing::info!(endpoint_id = %id, "Redialing endpoint after configuration change");
                    connection.connect_now();
                }
            }
            None => self.start(&endpoint),
        }
    }

    fn start(&self, endpoint: &Endpoint) {
        let connection = EndpointConnection::new(endpoint, Arc::clone(&self.context));
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(endpoint.id.clone(), Arc::clone(&connection));
        }
        connection.connect_now();
    }

    pub fn remove_endpoint(&self, id: &str) {
        let removed = self
            .connections
            .lock()
            .ok()
            .and_then(|mut connections| connections.remove(id));
        if let Some(connection) = removed {
            connection.close();
            tracing::info!(endpoint_id = %id, "Endpoint removed");
        }
    }

    /// Re-read every endpoint record and the global toggle
    pub fn reload_config(&self) {
        let endpoints = self.store().list_endpoints();
        let known: Vec<String> = self
            .connections
            .lock()
            .map(|connections| connections.keys().cloned().collect())
            .unwrap_or_default();

        for id in known {
            if !endpoints.iter().any(|e| e.id == id) {
                self.remove_endpoint(&id);
            }
        }
        for endpoint in &endpoints {
            self.sync_endpoint(&endpoint.id);
        }

        tracing::info!(
            endpoints = endpoints.len(),
            enabled = self.store().system_settings().endpoints.enabled,
            "Endpoint configuration applied"
        );
    }

    /// Manual reconnect: tear down and dial immediately with counters reset
    pub fn reconnect(&self, id: &str) -> bool {
        match self.get(id) {
            Some(connection) => {
                tracing::info!(endpoint_id = %id, "Manual endpoint reconnect");
                connection.connect_now();
                true
            }
            None => false,
        }
    }

    /// Push a frame to every open connection; returns how many accepted it
    pub fn broadcast(&self, frame: &str) -> usize {
        let connections: Vec<Arc<EndpointConnection>> = self
            .connections
            .lock()
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default();
        connections.iter().filter(|c| c.send_frame(frame)).count()
    }

    pub fn notify_tools_changed(&self) -> usize {
        match connection::list_changed_frame() {
            Some(frame) => self.broadcast(&frame),
            None => 0,
        }
    }

    pub fn statuses(&self) -> Vec<EndpointStatus> {
        let connections: Vec<Arc<EndpointConnection>> = self
            .connections
            .lock()
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default();
        let mut statuses: Vec<EndpointStatus> = connections.iter().map(|c| c.status()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Close every connection
    pub fn shutdown(&self) {
        let connections: Vec<Arc<EndpointConnection>> = self
            .connections
            .lock()
            .map(|mut connections| connections.drain().map(|(_, c)| c).collect())
            .unwrap_or_default();
        for connection in &connections {
            connection.close();
        }
        tracing::info!(endpoints = connections.len(), "Endpoint bridge stopped");
    }
}
