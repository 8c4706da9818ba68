//! Configuration store
//!
//! The hub reads backends, groups, endpoints and system settings through the
//! [`ConfigStore`] trait. Reads are synchronous and strongly consistent.
//! [`MemoryConfigStore`] keeps the whole settings document in memory and can be
//! loaded from (and persist status back to) an `mcp_settings.json` file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StoreError, StoreResult};
use crate::types::{BackendConfig, ConnectionStatus, Endpoint, Group, SystemSettings};

/// Read access to the persisted configuration
pub trait ConfigStore: Send + Sync {
    /// All backends in registration order
    fn list_backends(&self) -> Vec<BackendConfig>;

    fn get_backend(&self, name: &str) -> Option<BackendConfig>;

    fn backend_exists(&self, name: &str) -> bool {
        self.get_backend(name).is_some()
    }

    fn list_groups(&self) -> Vec<Group>;

    /// Look up a group by id, falling back to its name
    fn get_group(&self, id_or_name: &str) -> Option<Group>;

    fn list_endpoints(&self) -> Vec<Endpoint>;

    fn get_endpoint(&self, id: &str) -> Option<Endpoint>;

    fn save_endpoint_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        last_connected: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    fn system_settings(&self) -> SystemSettings;
}

/// The `mcp_settings.json` document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsDocument {
    #[serde(
        serialize_with = "serialize_backends",
        deserialize_with = "deserialize_backends"
    )]
    pub mcp_servers: Vec<BackendConfig>,
    pub groups: Vec<Group>,
    pub endpoints: Vec<Endpoint>,
    pub system_config: SystemSettings,
}

fn serialize_backends<S: Serializer>(
    backends: &[BackendConfig],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(backends.len()))?;
    for backend in backends {
        map.serialize_entry(&backend.name, backend)?;
    }
    map.end()
}

/// `mcpServers` is an object keyed by backend name; keep the document order
fn deserialize_backends<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<BackendConfig>, D::Error> {
    struct BackendsVisitor;

    impl<'de> Visitor<'de> for BackendsVisitor {
        type Value = Vec<BackendConfig>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of backend name to backend configuration")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut backends = Vec::new();
            while let Some((name, mut config)) = map.next_entry::<String, BackendConfig>()? {
                config.name = name;
                backends.push(config);
            }
            Ok(backends)
        }
    }

    deserializer.deserialize_map(BackendsVisitor)
}

impl SettingsDocument {
    fn validate(&self) -> StoreResult<()> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.mcp_servers {
            if backend.name.trim().is_empty() {
                return Err(StoreError::Validation("backend name cannot be empty".into()));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(StoreError::Validation(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
        }
        Ok(())
    }
}

/// In-memory store, optionally backed by a settings file
pub struct MemoryConfigStore {
    document: RwLock<SettingsDocument>,
    path: Option<PathBuf>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new(SettingsDocument::default())
    }
}

impl MemoryConfigStore {
    pub fn new(document: SettingsDocument) -> Self {
        Self {
            document: RwLock::new(document),
            path: None,
        }
    }

    pub fn from_json(json: &str) -> StoreResult<Self> {
        let document: SettingsDocument = serde_json::from_str(json)?;
        document.validate()?;
        Ok(Self::new(document))
    }

    /// Load a settings file; a missing file yields an empty document bound to that path
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let document = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<SettingsDocument>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Settings file not found, starting empty");
                SettingsDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        document.validate()?;

        Ok(Self {
            document: RwLock::new(document),
            path: Some(path.to_path_buf()),
        })
    }

    /// Full copy of the current document
    pub fn snapshot(&self) -> SettingsDocument {
        self.document
            .read()
            .map(|doc| doc.clone())
            .unwrap_or_default()
    }

    /// Write the current document back to the settings file, if any
    pub fn persist(&self) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Re-read the settings file, replacing the in-memory document.
    /// A store without a path keeps its document.
    pub fn reload(&self) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = std::fs::read_to_string(path)?;
        let document: SettingsDocument = serde_json::from_str(&contents)?;
        document.validate()?;
        self.write(|doc| *doc = document)
    }

    fn write<R>(&self, f: impl FnOnce(&mut SettingsDocument) -> R) -> StoreResult<R> {
        let mut doc = self
            .document
            .write()
            .map_err(|_| StoreError::Internal("settings lock poisoned".into()))?;
        Ok(f(&mut doc))
    }

    /// Insert or replace a backend by name
    pub fn upsert_backend(&self, config: BackendConfig) -> StoreResult<()> {
        if config.name.trim().is_empty() {
            return Err(StoreError::Validation("backend name cannot be empty".into()));
        }
        self.write(|doc| {
            match doc.mcp_servers.iter_mut().find(|b| b.name == config.name) {
                Some(existing) => *existing = config,
                None => doc.mcp_servers.push(config),
            }
        })
    }

    pub fn remove_backend(&self, name: &str) -> StoreResult<bool> {
        self.write(|doc| {
            let before = doc.mcp_servers.len();
            doc.mcp_servers.retain(|b| b.name != name);
            doc.mcp_servers.len() != before
        })
    }

    pub fn set_backend_enabled(&self, name: &str, enabled: bool) -> StoreResult<()> {
        self.write(|doc| {
            doc.mcp_servers
                .iter_mut()
                .find(|b| b.name == name)
                .map(|b| b.enabled = enabled)
        })?
        .ok_or_else(|| StoreError::NotFound(format!("backend '{name}'")))
    }

    pub fn upsert_group(&self, group: Group) -> StoreResult<()> {
        self.write(|doc| match doc.groups.iter_mut().find(|g| g.id == group.id) {
            Some(existing) => *existing = group,
            None => doc.groups.push(group),
        })
    }

    pub fn remove_group(&self, id: &str) -> StoreResult<bool> {
        self.write(|doc| {
            let before = doc.groups.len();
            doc.groups.retain(|g| g.id != id);
            doc.groups.len() != before
        })
    }

    pub fn upsert_endpoint(&self, endpoint: Endpoint) -> StoreResult<()> {
        self.write(|doc| {
            match doc.endpoints.iter_mut().find(|e| e.id == endpoint.id) {
                Some(existing) => *existing = endpoint,
                None => doc.endpoints.push(endpoint),
            }
        })
    }

    pub fn remove_endpoint(&self, id: &str) -> StoreResult<bool> {
        self.write(|doc| {
            let before = doc.endpoints.len();
            doc.endpoints.retain(|e| e.id != id);
            doc.endpoints.len() != before
        })
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut SystemSettings)) -> StoreResult<()> {
        self.write(|doc| f(&mut doc.system_config))
    }
}

impl ConfigStore for MemoryConfigStore {
    fn list_backends(&self) -> Vec<BackendConfig> {
        self.snapshot().mcp_servers
    }

    fn get_backend(&self, name: &str) -> Option<BackendConfig> {
        let doc = self.document.read().ok()?;
        doc.mcp_servers.iter().find(|b| b.name == name).cloned()
    }

    fn list_groups(&self) -> Vec<Group> {
        self.snapshot().groups
    }

    fn get_group(&self, id_or_name: &str) -> Option<Group> {
        let doc = self.document.read().ok()?;
        doc.groups
            .iter()
            .find(|g| g.id == id_or_name)
            .or_else(|| doc.groups.iter().find(|g| g.name == id_or_name))
            .cloned()
    }

    fn list_endpoints(&self) -> Vec<Endpoint> {
        self.snapshot().endpoints
    }

    fn get_endpoint(&self, id: &str) -> Option<Endpoint> {
        let doc = self.document.read().ok()?;
        doc.endpoints.iter().find(|e| e.id == id).cloned()
    }

    fn save_endpoint_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        last_connected: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.write(|doc| {
            doc.endpoints.iter_mut().find(|e| e.id == id).map(|e| {
                e.status = status;
                if last_connected.is_some() {
                    e.last_connected = last_connected;
                }
            })
        })?
        .ok_or_else(|| StoreError::NotFound(format!("endpoint '{id}'")))?;

        if let Err(e) = self.persist() {
            tracing::warn!(endpoint_id = %id, error = %e, "Failed to persist endpoint status");
        }
        Ok(())
    }

    fn system_settings(&self) -> SystemSettings {
        self.document
            .read()
            .map(|doc| doc.system_config.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    const SETTINGS: &str = r#"{
        "mcpServers": {
            "weather": {"type": "streamable-http", "url": "http://localhost:9000/mcp"},
            "fetch": {"command": "uvx", "args": ["mcp-server-fetch"]},
            "amap": {"type": "sse", "url": "http://localhost:9001/sse", "enabled": false}
        },
        "groups": [
            {"id": "g1", "name": "outdoors", "servers": [{"name": "weather", "tools": "all"}]}
        ],
        "endpoints": [
            {"id": "endpoint-1", "name": "speaker", "webSocketUrl": "wss://example.com/mcp"}
        ],
        "systemConfig": {"smartRouting": {"enabled": true}}
    }"#;

    #[test]
    fn test_load_keeps_document_order() {
        let store = MemoryConfigStore::from_json(SETTINGS).unwrap();
        let names: Vec<String> = store.list_backends().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["weather", "fetch", "amap"]);

        let fetch = store.get_backend("fetch").unwrap();
        assert_eq!(fetch.kind, TransportKind::Stdio);
        assert!(!store.get_backend("amap").unwrap().enabled);
        assert!(store.system_settings().smart_routing.enabled);
    }

    #[test]
    fn test_get_group_by_id_or_name() {
        let store = MemoryConfigStore::from_json(SETTINGS).unwrap();
        assert_eq!(store.get_group("g1").unwrap().name, "outdoors");
        assert_eq!(store.get_group("outdoors").unwrap().id, "g1");
        assert!(store.get_group("missing").is_none());
    }

    #[test]
    fn test_duplicate_backend_names_rejected() {
        let json = r#"{"mcpServers": {"a": {"command": "x"}, "a": {"command": "y"}}}"#;
        assert!(matches!(
            MemoryConfigStore::from_json(json),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_upsert_and_toggle_backend() {
        let store = MemoryConfigStore::default();
        store
            .upsert_backend(BackendConfig::stdio("fetch", "uvx", vec![]))
            .unwrap();
        assert!(store.backend_exists("fetch"));

        store.set_backend_enabled("fetch", false).unwrap();
        assert!(!store.get_backend("fetch").unwrap().enabled);
        assert!(matches!(
            store.set_backend_enabled("nope", true),
            Err(StoreError::NotFound(_))
        ));

        assert!(store.remove_backend("fetch").unwrap());
        assert!(!store.backend_exists("fetch"));
    }

    #[test]
    fn test_group_and_endpoint_edits() {
        let store = MemoryConfigStore::from_json(SETTINGS).unwrap();
        store
            .upsert_backend(BackendConfig::streamable_http("search", "http://localhost:9002/mcp"))
            .unwrap();

        let mut group = store.get_group("g1").unwrap();
        group.servers.push(crate::types::GroupServer {
            name: "search".into(),
            tools: Default::default(),
        });
        store.upsert_group(group).unwrap();
        assert_eq!(store.get_group("outdoors").unwrap().server_names(), vec!["weather", "search"]);
        assert!(store.remove_group("g1").unwrap());
        assert!(!store.remove_group("g1").unwrap());
        assert!(store.list_groups().is_empty());

        let mut endpoint = store.get_endpoint("endpoint-1").unwrap();
        endpoint.group_id = Some("g1".into());
        store.upsert_endpoint(endpoint).unwrap();
        store
            .upsert_endpoint(Endpoint::new("endpoint-2", "kiosk", "ws://localhost:8765"))
            .unwrap();
        let endpoints = store.list_endpoints();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].group_id.as_deref(), Some("g1"));
        assert!(store.remove_endpoint("endpoint-2").unwrap());
    }

    #[test]
    fn test_save_endpoint_status_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_settings.json");
        std::fs::write(&path, SETTINGS).unwrap();

        let store = MemoryConfigStore::load(&path).unwrap();
        let now = Utc::now();
        store
            .save_endpoint_status("endpoint-1", ConnectionStatus::Connected, Some(now))
            .unwrap();

        let reloaded = MemoryConfigStore::load(&path).unwrap();
        let endpoint = reloaded.get_endpoint("endpoint-1").unwrap();
        assert_eq!(endpoint.status, ConnectionStatus::Connected);
        assert_eq!(endpoint.last_connected, Some(now));

        // A disconnect keeps the last successful timestamp
        store
            .save_endpoint_status("endpoint-1", ConnectionStatus::Disconnected, None)
            .unwrap();
        assert_eq!(store.get_endpoint("endpoint-1").unwrap().last_connected, Some(now));
    }

    #[test]
    fn test_missing_settings_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryConfigStore::load(dir.path().join("absent.json")).unwrap();
        assert!(store.list_backends().is_empty());
        assert!(store.list_endpoints().is_empty());
    }

    #[test]
    fn test_reload_picks_up_file_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_settings.json");
        std::fs::write(&path, SETTINGS).unwrap();

        let store = MemoryConfigStore::load(&path).unwrap();
        assert!(store.backend_exists("amap"));

        std::fs::write(&path, r#"{"mcpServers": {"solo": {"command": "node"}}}"#).unwrap();
        store.reload().unwrap();

        let names: Vec<String> = store.list_backends().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["solo"]);
        assert!(store.list_endpoints().is_empty());
    }
}
