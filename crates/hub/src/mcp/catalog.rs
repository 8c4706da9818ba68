//! Runtime view of every configured backend.
//!
//! Entries are immutable [`BackendRuntime`] values behind an index keyed by
//! backend name. Writers replace whole entries, so readers always see a
//! consistent status/tool set pair for a backend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use mcphub_shared::{BackendConfig, ConnectionStatus, TransportKind};
use serde::Serialize;

use super::adapter::UpstreamAdapter;
use super::types::{Prompt, Tool};

/// Separator between backend name and local tool name
pub const NAME_SEPARATOR: &str = "-";

/// `<backend>-<local>`
pub fn namespaced(backend: &str, local: &str) -> String {
    format!("{}{}{}", backend, NAME_SEPARATOR, local)
}

/// Strip the `<backend>-` prefix; names without it pass through unchanged
pub fn local_name<'a>(backend: &str, name: &'a str) -> &'a str {
    name.strip_prefix(backend)
        .and_then(|rest| rest.strip_prefix(NAME_SEPARATOR))
        .unwrap_or(name)
}

/// Holder for a backend's live adapter.
///
/// Calls clone the adapter out from under a read lock. A transparent reconnect
/// takes the write lock, so new calls wait for it while calls already running
/// finish against the adapter they started with.
pub struct BackendSession {
    adapter: tokio::sync::RwLock<Arc<dyn UpstreamAdapter>>,
}

impl BackendSession {
    pub fn new(adapter: Arc<dyn UpstreamAdapter>) -> Self {
        Self {
            adapter: tokio::sync::RwLock::new(adapter),
        }
    }

    pub async fn current(&self) -> Arc<dyn UpstreamAdapter> {
        Arc::clone(&*self.adapter.read().await)
    }

    pub(crate) async fn lock_for_swap(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, Arc<dyn UpstreamAdapter>> {
        self.adapter.write().await
    }
}

#[derive(Clone)]
pub struct BackendRuntime {
    pub name: String,
    pub owner: Option<String>,
    pub kind: TransportKind,
    pub enabled: bool,
    pub status: ConnectionStatus,
    pub error: Option<String>,
    /// Namespaced tools as last listed
    pub tools: Arc<Vec<Tool>>,
    /// Namespaced prompts as last listed
    pub prompts: Arc<Vec<Prompt>>,
    pub created_at: DateTime<Utc>,
    pub generation: u64,
    pub session: Option<Arc<BackendSession>>,
}

impl BackendRuntime {
    pub fn connecting(config: &BackendConfig, generation: u64) -> Self {
        Self {
            name: config.name.clone(),
            owner: config.owner.clone(),
            kind: config.kind,
            enabled: true,
            status: ConnectionStatus::Connecting,
            error: None,
            tools: Arc::new(Vec::new()),
            prompts: Arc::new(Vec::new()),
            created_at: Utc::now(),
            generation,
            session: None,
        }
    }

    pub fn disabled(config: &BackendConfig) -> Self {
        Self {
            enabled: false,
            status: ConnectionStatus::Disconnected,
            ..Self::connecting(config, 0)
        }
    }

    pub fn is_serving(&self) -> bool {
        self.enabled && self.status == ConnectionStatus::Connected && self.session.is_some()
    }

    pub fn has_prompt(&self, namespaced_name: &str) -> bool {
        self.prompts.iter().any(|p| p.name == namespaced_name)
    }

    pub fn summary(&self) -> BackendSummary {
        BackendSummary {
            name: self.name.clone(),
            transport: self.kind,
            status: self.status,
            enabled: self.enabled,
            error: self.error.clone(),
            tools: self.tools.len(),
            prompts: self.prompts.len(),
            created_at: self.created_at,
        }
    }
}

/// Serializable status line for one backend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSummary {
    pub name: String,
    pub transport: TransportKind,
    pub status: ConnectionStatus,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tools: usize,
    pub prompts: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct CatalogIndex {
    order: Vec<String>,
    backends: HashMap<String, Arc<BackendRuntime>>,
}

#[derive(Default)]
pub struct Catalog {
    inner: RwLock<CatalogIndex>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendRuntime>> {
        self.inner.read().ok()?.backends.get(name).cloned()
    }

    /// All runtimes in configuration order
    pub fn snapshot(&self) -> Vec<Arc<BackendRuntime>> {
        let Ok(index) = self.inner.read() else {
            return Vec::new();
        };
        index
            .order
            .iter()
            .filter_map(|name| index.backends.get(name).cloned())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|index| index.order.clone())
            .unwrap_or_default()
    }

    pub fn upsert(&self, runtime: BackendRuntime) -> Arc<BackendRuntime> {
        let runtime = Arc::new(runtime);
        if let Ok(mut index) = self.inner.write() {
            if !index.backends.contains_key(&runtime.name) {
                index.order.push(runtime.name.clone());
            }
            index
                .backends
                .insert(runtime.name.clone(), Arc::clone(&runtime));
        }
        runtime
    }

    /// Replace the entry only if it still belongs to `generation`
    pub fn update_if<F>(&self, name: &str, generation: u64, update: F) -> Option<Arc<BackendRuntime>>
    where
        F: FnOnce(&BackendRuntime) -> BackendRuntime,
    {
        let mut index = self.inner.write().ok()?;
        let current = index.backends.get(name)?;
        if current.generation != generation {
            return None;
        }
        let next = Arc::new(update(current));
        index.backends.insert(name.to_string(), Arc::clone(&next));
        Some(next)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<BackendRuntime>> {
        let mut index = self.inner.write().ok()?;
        index.order.retain(|n| n != name);
        index.backends.remove(name)
    }

    /// Reorder to match configuration; unknown names are ignored
    pub fn set_order(&self, names: &[String]) {
        if let Ok(mut index) = self.inner.write() {
            let mut order: Vec<String> = names
                .iter()
                .filter(|n| index.backends.contains_key(*n))
                .cloned()
                .collect();
            for name in &index.order {
                if !order.contains(name) {
                    order.push(name.clone());
                }
            }
            index.order = order;
        }
    }
}
