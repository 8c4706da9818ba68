//! Upstream Connection Manager
//!
//! Owns one lifecycle per configured backend: connect, list, serve, and
//! reconnect through a [`ReconnectMachine`] when the connection fails. Every
//! async completion carries the generation it was started under and is dropped
//! when the backend has since been disabled, removed or re-registered.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use mcphub_shared::{
    BackendConfig, ConfigStore, ConnectionStatus, ReconnectPolicy, SystemSettings, TransportKind,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::adapter::{AdapterFactory, ConnectPhase, UpstreamAdapter};
use super::catalog::{namespaced, BackendRuntime, BackendSession, BackendSummary, Catalog};
use super::client::{McpClientError, McpResult};
use super::search::ToolSearch;
use super::types::{clean_input_schema, Prompt, PromptGetResult, Tool, ToolCallResult};
use crate::reconnect::{spawn_retry, ReconnectLimits, ReconnectMachine, RetryDecision};

/// Poll interval for [`BackendManager::wait_until_settled`]
const SETTLE_POLL: Duration = Duration::from_millis(100);

/// Retry and keep-alive tunables for upstream backends
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub reconnect: ReconnectPolicy,
    pub limits: ReconnectLimits,
    /// Keep-alive interval for SSE backends that do not set their own
    pub keep_alive: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            limits: ReconnectLimits::default(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

struct Slot {
    machine: ReconnectMachine,
    /// Cancels the retry timer, keep-alive and close watcher of the current generation
    cancel: CancellationToken,
}

/// Result of a configuration reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub reindexed: bool,
}

pub struct BackendManager {
    store: Arc<dyn ConfigStore>,
    factory: Arc<dyn AdapterFactory>,
    catalog: Arc<Catalog>,
    search: Arc<dyn ToolSearch>,
    settings: ManagerSettings,
    slots: Mutex<HashMap<String, Slot>>,
    /// Last generation handed out. Survives slot removal so a re-added
    /// backend never reuses the generation of a connect still in flight.
    generations: AtomicU64,
    tools_changed: broadcast::Sender<()>,
    /// Similarity settings seen by the last registration pass
    last_settings: Mutex<SystemSettings>,
    started: AtomicBool,
}

impl BackendManager {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        factory: Arc<dyn AdapterFactory>,
        search: Arc<dyn ToolSearch>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        let (tools_changed, _) = broadcast::channel(32);
        let last_settings = store.system_settings();
        Arc::new(Self {
            store,
            factory,
            catalog: Arc::new(Catalog::new()),
            search,
            settings,
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            tools_changed,
            last_settings: Mutex::new(last_settings),
            started: AtomicBool::new(false),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn search(&self) -> &Arc<dyn ToolSearch> {
        &self.search
    }

    /// Fires whenever any backend's tool set changes
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tools_changed.subscribe()
    }

    fn publish_tools_changed(&self) {
        let _ = self.tools_changed.send(());
    }

    pub fn summaries(&self) -> Vec<BackendSummary> {
        self.catalog.snapshot().iter().map(|rt| rt.summary()).collect()
    }

    /// Registration pass over the configuration.
    ///
    /// Disabled backends are torn down, connected backends other than `target`
    /// are left alone, and everything else gets a fresh generation and a
    /// connection task. Backends missing from the configuration are removed.
    pub async fn register_all(self: &Arc<Self>, target: Option<&str>) {
        let phase = if self.started.swap(true, Ordering::SeqCst) {
            ConnectPhase::Steady
        } else {
            ConnectPhase::Startup
        };

        let configs = self.store.list_backends();
        let configured: HashSet<&str> = configs.iter().map(|c| c.name.as_str()).collect();

        for name in self.catalog.names() {
            if !configured.contains(name.as_str()) {
                self.remove_backend(&name).await;
            }
        }

        for config in &configs {
            if !config.enabled {
                self.disable(config).await;
                continue;
            }

            let untouched = self.catalog.get(&config.name).is_some_and(|rt| {
                rt.status == ConnectionStatus::Connected && target != Some(config.name.as_str())
            });
            if untouched {
                continue;
            }

            self.start(config, phase).await;
        }

        let order: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
        self.catalog.set_order(&order);

        if let Ok(mut last) = self.last_settings.lock() {
            *last = self.store.system_settings();
        }
    }

    /// Re-read configuration and re-register; re-index search when a backend
    /// appears while smart routing is on or the similarity settings changed
    pub async fn reload(self: &Arc<Self>) -> ReloadOutcome {
        let before: HashSet<String> = self.catalog.names().into_iter().collect();
        let previous = self
            .last_settings
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();

        self.register_all(None).await;

        let after: HashSet<String> = self.catalog.names().into_iter().collect();
        let mut added: Vec<String> = after.difference(&before).cloned().collect();
        let mut removed: Vec<String> = before.difference(&after).cloned().collect();
        added.sort();
        removed.sort();

        let current = self.store.system_settings();
        let similarity_changed = previous.smart_routing != current.smart_routing;
        let reindexed =
            (current.smart_routing.enabled && !added.is_empty()) || similarity_changed;

        if reindexed {
            let entries: Vec<(String, Vec<Tool>)> = self
                .catalog
                .snapshot()
                .iter()
                .filter(|rt| rt.is_serving())
                .map(|rt| (rt.name.clone(), rt.tools.as_ref().clone()))
                .collect();
            tracing::info!(backends = entries.len(), "Re-indexing tools for smart routing");
            self.search.rebuild(entries).await;
        }

        tracing::info!(added = ?added, removed = ?removed, reindexed, "Backend configuration reloaded");
        ReloadOutcome {
            added,
            removed,
            reindexed,
        }
    }

    /// Start a new generation for `config` and spawn its first attempt
    async fn start(self: &Arc<Self>, config: &BackendConfig, phase: ConnectPhase) {
        let generation = {
            let Ok(mut slots) = self.slots.lock() else {
                return;
            };
            let slot = slots.entry(config.name.clone()).or_insert_with(|| Slot {
                machine: ReconnectMachine::new(
                    config.name.clone(),
                    self.settings.reconnect.clone(),
                    self.settings.limits.clone(),
                ),
                cancel: CancellationToken::new(),
            });
            slot.cancel.cancel();
            slot.cancel = CancellationToken::new();
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            slot.machine.reset_to(generation);
            generation
        };

        let previous = self.catalog.get(&config.name);
        self.catalog
            .upsert(BackendRuntime::connecting(config, generation));
        if let Some(old) = previous.and_then(|rt| rt.session.clone()) {
            tokio::spawn(async move { old.current().await.close().await });
        }

        tracing::info!(backend = %config.name, transport = %config.kind, generation, "Registering backend");
        tokio::spawn(Arc::clone(self).attempt(config.name.clone(), generation, phase));
    }

    fn is_current(&self, name: &str, generation: u64) -> bool {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(name).map(|s| s.machine.is_current(generation)))
            .unwrap_or(false)
    }

    /// One connection attempt. Boxed so retries can schedule further attempts.
    fn attempt(self: Arc<Self>, name: String, generation: u64, phase: ConnectPhase) -> BoxFuture<'static, ()> {
        async move {
            let began = self.slots.lock().ok().and_then(|mut slots| {
                let slot = slots.get_mut(&name)?;
                if !slot.machine.is_current(generation) {
                    return None;
                }
                slot.machine.begin_connect()?;
                Some(slot.cancel.clone())
            });
            let Some(cancel) = began else {
                return;
            };

            let Some(config) = self.store.get_backend(&name).filter(|c| c.enabled) else {
                return;
            };
            self.catalog.update_if(&name, generation, |rt| BackendRuntime {
                status: ConnectionStatus::Connecting,
                ..rt.clone()
            });

            let settings = self.store.system_settings();
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(backend = %name, generation, "Connect abandoned");
                    return;
                }
                result = self.factory.connect(&config, &settings, phase) => result,
            };

            let adapter = match connected {
                Ok(adapter) => adapter,
                Err(e) => {
                    self.on_failure(&name, generation, e);
                    return;
                }
            };

            if !self.is_current(&name, generation) {
                tracing::debug!(backend = %name, generation, "Discarding stale connection");
                adapter.close().await;
                return;
            }

            match list_catalog(&name, adapter.as_ref()).await {
                Ok((tools, prompts)) => {
                    self.on_connected(&name, generation, adapter, tools, prompts)
                        .await
                }
                Err(e) => {
                    adapter.close().await;
                    self.on_failure(&name, generation, e);
                }
            }
        }
        .boxed()
    }

    async fn on_connected(
        self: &Arc<Self>,
        name: &str,
        generation: u64,
        adapter: Arc<dyn UpstreamAdapter>,
        tools: Vec<Tool>,
        prompts: Vec<Prompt>,
    ) {
        let cancel = {
            let Ok(mut slots) = self.slots.lock() else {
                return;
            };
            match slots.get_mut(name) {
                Some(slot) if slot.machine.is_current(generation) => {
                    slot.machine.on_connected();
                    Some(slot.cancel.clone())
                }
                _ => None,
            }
        };
        let Some(cancel) = cancel else {
            adapter.close().await;
            return;
        };

        let kind = adapter.kind();
        let session = Arc::new(BackendSession::new(Arc::clone(&adapter)));
        let tool_count = tools.len();
        let tools = Arc::new(tools);
        let updated = self.catalog.update_if(name, generation, |rt| BackendRuntime {
            status: ConnectionStatus::Connected,
            error: None,
            tools: Arc::clone(&tools),
            prompts: Arc::new(prompts),
            session: Some(Arc::clone(&session)),
            ..rt.clone()
        });
        if updated.is_none() {
            adapter.close().await;
            return;
        }

        tracing::info!(backend = %name, tools = tool_count, "Backend connected");

        self.search.index(name, &tools).await;
        self.publish_tools_changed();

        self.watch_close(name, generation, Arc::clone(&adapter), cancel.clone());
        if kind == TransportKind::Sse {
            self.spawn_keepalive(name, session, cancel);
        }
    }

    /// Mark the backend disconnected when its transport goes away on its own
    fn watch_close(
        self: &Arc<Self>,
        name: &str,
        generation: u64,
        adapter: Arc<dyn UpstreamAdapter>,
        cancel: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        let name = name.to_string();
        let closed = adapter.closed();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = closed.cancelled() => {
                    let still_serving = match manager.catalog.get(&name).and_then(|rt| rt.session.clone()) {
                        Some(session) => Arc::ptr_eq(&session.current().await, &adapter),
                        None => false,
                    };
                    if still_serving {
                        manager.on_disconnect(&name, generation);
                    }
                }
            }
        });
    }

    fn spawn_keepalive(self: &Arc<Self>, name: &str, session: Arc<BackendSession>, cancel: CancellationToken) {
        let interval = self
            .store
            .get_backend(name)
            .map(|c| c.keep_alive_or(self.settings.keep_alive))
            .unwrap_or(self.settings.keep_alive)
            .max(SETTLE_POLL);
        let name = name.to_string();

        tracing::info!(backend = %name, interval = ?interval, "Keep-alive ping scheduled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match session.current().await.ping().await {
                            Ok(()) => tracing::debug!(backend = %name, "Keep-alive ping successful"),
                            Err(e) => tracing::warn!(backend = %name, error = %e, "Keep-alive ping failed"),
                        }
                    }
                }
            }
        });
    }

    fn on_disconnect(self: &Arc<Self>, name: &str, generation: u64) {
        tracing::warn!(backend = %name, "Upstream connection closed");
        let updated = self.catalog.update_if(name, generation, |rt| BackendRuntime {
            status: ConnectionStatus::Disconnected,
            error: Some("connection closed".to_string()),
            tools: Arc::new(Vec::new()),
            prompts: Arc::new(Vec::new()),
            session: None,
            ..rt.clone()
        });
        if updated.is_some() {
            let search = Arc::clone(&self.search);
            let name_owned = name.to_string();
            tokio::spawn(async move { search.remove(&name_owned).await });
            self.publish_tools_changed();
        }
        self.schedule_retry(name, generation);
    }

    fn on_failure(self: &Arc<Self>, name: &str, generation: u64, error: McpClientError) {
        let updated = self.catalog.update_if(name, generation, |rt| BackendRuntime {
            status: ConnectionStatus::Disconnected,
            error: Some(error.to_string()),
            session: None,
            ..rt.clone()
        });
        if updated.is_none() {
            return;
        }

        if error.is_configuration() {
            tracing::error!(backend = %name, error = %error, "Backend misconfigured, not retrying");
            return;
        }

        tracing::warn!(backend = %name, error = %error, "Failed to connect backend");
        self.schedule_retry(name, generation);
    }

    fn schedule_retry(self: &Arc<Self>, name: &str, generation: u64) {
        let scheduled = self.slots.lock().ok().and_then(|mut slots| {
            let slot = slots.get_mut(name)?;
            if !slot.machine.is_current(generation) {
                return None;
            }
            Some((slot.machine.on_failure(), slot.cancel.clone()))
        });
        let Some((decision, cancel)) = scheduled else {
            return;
        };

        match decision {
            RetryDecision::Retry { delay, generation } => {
                tracing::info!(backend = %name, delay = ?delay, "Scheduling reconnect");
                let manager = Arc::clone(self);
                let name = name.to_string();
                spawn_retry(delay, cancel, move || {
                    manager.attempt(name, generation, ConnectPhase::Steady)
                });
            }
            RetryDecision::Exhausted => {
                tracing::error!(backend = %name, "Giving up on backend after exhausting reconnect attempts");
            }
            RetryDecision::Stopped => {}
        }
    }

    /// Tear down a disabled backend and keep it listed without tools
    async fn disable(self: &Arc<Self>, config: &BackendConfig) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(&config.name) {
                slot.cancel.cancel();
                slot.machine.manual_close();
            }
        }

        let previous = self.catalog.get(&config.name);
        let already_disabled = previous.as_ref().is_some_and(|rt| !rt.enabled);
        if already_disabled {
            return;
        }

        self.catalog.upsert(BackendRuntime::disabled(config));
        if let Some(session) = previous.and_then(|rt| rt.session.clone()) {
            session.current().await.close().await;
        }
        self.search.remove(&config.name).await;
        tracing::info!(backend = %config.name, "Backend disabled");
        self.publish_tools_changed();
    }

    /// Close and forget a backend
    pub async fn remove_backend(self: &Arc<Self>, name: &str) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(mut slot) = slots.remove(name) {
                slot.cancel.cancel();
                slot.machine.manual_close();
            }
        }

        if let Some(runtime) = self.catalog.remove(name) {
            if let Some(session) = &runtime.session {
                session.current().await.close().await;
            }
        }
        self.search.remove(name).await;
        tracing::info!(backend = %name, "Backend removed");
        self.publish_tools_changed();
    }

    /// Call a tool on a backend by its local name.
    ///
    /// Streamable HTTP backends that answer with a 4xx get one transparent
    /// reconnect (fresh adapter, tools and prompts re-listed) followed by a
    /// single retry.
    pub async fn call_tool(self: &Arc<Self>, backend: &str, local: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let session = self.serving_session(backend)?;
        let adapter = session.current().await;

        match adapter.call_tool(local, arguments.clone()).await {
            Err(e) if e.is_client_http_error() && adapter.kind() == TransportKind::StreamableHttp => {
                tracing::warn!(
                    backend = %backend,
                    error = %e,
                    "HTTP 4xx from streamable HTTP backend, reconnecting before retry"
                );
                self.reconnect_session(backend, &session, &adapter).await?;
                session.current().await.call_tool(local, arguments).await
            }
            other => other,
        }
    }

    pub async fn get_prompt(&self, backend: &str, local: &str, arguments: Value) -> McpResult<PromptGetResult> {
        let session = self.serving_session(backend)?;
        let adapter = session.current().await;
        adapter.get_prompt(local, arguments).await
    }

    fn serving_session(&self, backend: &str) -> McpResult<Arc<BackendSession>> {
        self.catalog
            .get(backend)
            .filter(|rt| rt.is_serving())
            .and_then(|rt| rt.session.clone())
            .ok_or(McpClientError::NotConnected)
    }

    /// Swap in a fresh adapter for `stale`, unless someone already did.
    ///
    /// New calls block on the session while the swap is in progress. The close
    /// watcher of the stale adapter sees it is no longer current and stays quiet.
    async fn reconnect_session(
        self: &Arc<Self>,
        backend: &str,
        session: &Arc<BackendSession>,
        stale: &Arc<dyn UpstreamAdapter>,
    ) -> McpResult<()> {
        let mut current = session.lock_for_swap().await;
        if !Arc::ptr_eq(&*current, stale) {
            return Ok(());
        }

        let config = self
            .store
            .get_backend(backend)
            .filter(|c| c.enabled)
            .ok_or(McpClientError::NotConnected)?;
        let settings = self.store.system_settings();

        stale.close().await;
        let fresh = self
            .factory
            .connect(&config, &settings, ConnectPhase::Steady)
            .await?;
        let (tools, prompts) = match list_catalog(backend, fresh.as_ref()).await {
            Ok(listed) => listed,
            Err(e) => {
                fresh.close().await;
                return Err(e);
            }
        };
        *current = Arc::clone(&fresh);
        drop(current);

        let tools = Arc::new(tools);
        let runtime = self.catalog.get(backend);
        let cancel = self
            .slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(backend).map(|s| s.cancel.clone()));
        if let (Some(runtime), Some(cancel)) = (runtime, cancel) {
            self.catalog.update_if(backend, runtime.generation, |rt| BackendRuntime {
                tools: Arc::clone(&tools),
                prompts: Arc::new(prompts),
                ..rt.clone()
            });
            self.watch_close(backend, runtime.generation, fresh, cancel);
        }
        self.search.index(backend, &tools).await;
        self.publish_tools_changed();

        tracing::info!(backend = %backend, "Backend reconnected after HTTP 4xx");
        Ok(())
    }

    /// Wait until no backend is `connecting`, or until `timeout` elapses
    pub async fn wait_until_settled(&self, timeout: Duration) -> bool {
        let settled = tokio::time::timeout(timeout, async {
            loop {
                let connecting = self
                    .catalog
                    .snapshot()
                    .iter()
                    .filter(|rt| rt.status == ConnectionStatus::Connecting)
                    .count();
                if connecting == 0 {
                    return;
                }
                tokio::time::sleep(SETTLE_POLL).await;
            }
        })
        .await
        .is_ok();

        let connected = self
            .catalog
            .snapshot()
            .iter()
            .filter(|rt| rt.is_serving())
            .count();
        let tools: usize = self.catalog.snapshot().iter().map(|rt| rt.tools.len()).sum();
        if settled {
            tracing::info!(connected, tools, "All backends settled");
        } else {
            tracing::warn!(connected, tools, "Timed out waiting for backends to settle");
        }
        settled
    }

    /// Close every adapter and stop all retry timers
    pub async fn shutdown(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            for slot in slots.values_mut() {
                slot.cancel.cancel();
                slot.machine.manual_close();
            }
        }

        let sessions: Vec<Arc<BackendSession>> = self
            .catalog
            .snapshot()
            .iter()
            .filter_map(|rt| rt.session.clone())
            .collect();
        join_all(sessions.iter().map(|s| async move { s.current().await.close().await })).await;

        tracing::info!(backends = sessions.len(), "All upstream connections closed");
    }
}

/// List tools (and prompts when advertised), namespaced under `backend`
async fn list_catalog(backend: &str, adapter: &dyn UpstreamAdapter) -> McpResult<(Vec<Tool>, Vec<Prompt>)> {
    let tools = if adapter.supports_tools() {
        adapter
            .list_tools()
            .await?
            .into_iter()
            .map(|mut tool| {
                tool.name = namespaced(backend, &tool.name);
                tool.input_schema = clean_input_schema(tool.input_schema);
                tool
            })
            .collect()
    } else {
        Vec::new()
    };

    let prompts = if adapter.supports_prompts() {
        match adapter.list_prompts().await {
            Ok(prompts) => prompts
                .into_iter()
                .map(|mut prompt| {
                    prompt.name = namespaced(backend, &prompt.name);
                    prompt
                })
                .collect(),
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "Failed to list prompts");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    Ok((tools, prompts))
}
