//! Application state shared by every HTTP handler

use std::sync::Arc;

use mcphub_shared::{ConfigStore, MemoryConfigStore, StoreResult};
use tokio::sync::broadcast::error::RecvError;

use crate::bridge::connection::list_changed_frame;
use crate::bridge::EndpointBridge;
use crate::config::Config;
use crate::mcp::manager::{BackendManager, ManagerSettings, ReloadOutcome};
use crate::mcp::{AdapterFactory, McpRequestHandler, McpRouter, SessionKind, ToolSearch};
use crate::reconnect::ReconnectLimits;
use crate::websocket::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryConfigStore>,
    pub manager: Arc<BackendManager>,
    pub router: Arc<McpRouter>,
    /// Handler for HTTP and WebSocket clients
    pub handler: Arc<McpRequestHandler>,
    pub bridge: Arc<EndpointBridge>,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(
        store: Arc<MemoryConfigStore>,
        factory: Arc<dyn AdapterFactory>,
        search: Arc<dyn ToolSearch>,
        manager_settings: ManagerSettings,
        endpoint_limits: ReconnectLimits,
    ) -> Self {
        let config_store: Arc<dyn ConfigStore> = store.clone();
        let manager = BackendManager::new(Arc::clone(&config_store), factory, search, manager_settings);
        let router = Arc::new(McpRouter::new(Arc::clone(&manager)));

        let handler = Arc::new(McpRequestHandler::new(Arc::clone(&router), SessionKind::Local));
        let bridge_handler = Arc::new(McpRequestHandler::new(Arc::clone(&router), SessionKind::Bridge));
        let bridge = EndpointBridge::new(config_store, bridge_handler, endpoint_limits);

        Self {
            store,
            manager,
            router,
            handler,
            bridge,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<MemoryConfigStore>,
        factory: Arc<dyn AdapterFactory>,
        search: Arc<dyn ToolSearch>,
    ) -> Self {
        Self::new(
            store,
            factory,
            search,
            config.manager_settings(),
            config.endpoint_limits(),
        )
    }

    /// Forward every tools-changed event to bridges and local sessions
    pub fn spawn_change_fanout(&self) -> tokio::task::JoinHandle<()> {
        let mut events = self.manager.subscribe();
        let bridge = Arc::clone(&self.bridge);
        let sessions = self.sessions.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        let endpoints = bridge.notify_tools_changed();
                        let local = match list_changed_frame() {
                            Some(frame) => sessions.broadcast(&frame).await,
                            None => 0,
                        };
                        tracing::debug!(endpoints, local, "Tools changed notification sent");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Register every backend and dial every endpoint
    pub async fn start(&self) {
        self.manager.register_all(None).await;
        self.bridge.reload_config();
    }

    /// Re-read the settings file and apply it to backends and endpoints
    pub async fn reload(&self) -> StoreResult<ReloadOutcome> {
        self.store.reload()?;
        let outcome = self.manager.reload().await;
        self.bridge.reload_config();
        Ok(outcome)
    }

    pub async fn shutdown(&self) {
        self.bridge.shutdown();
        self.manager.shutdown().await;
    }
}
