//! Configuration entities shared across MCPHub
//!
//! These are the records held by the configuration store. The field names follow
//! the `mcp_settings.json` document layout (camelCase).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

fn default_true() -> bool {
    true
}

// =============================================================================
// Backends
// =============================================================================

/// Wire style used to reach an upstream backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Child process speaking JSON-RPC over stdin/stdout
    #[default]
    Stdio,
    /// Legacy server-sent events stream plus a POST channel
    Sse,
    /// Single streaming HTTP exchange per request
    StreamableHttp,
    /// OpenAPI document turned into tools
    Openapi,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::Openapi => "openapi",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an OpenAPI backend gets its document from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenApiSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Inline document, used when no URL is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// Per-tool or per-prompt override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for ItemOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            description: None,
        }
    }
}

/// Request options applied to calls against one backend (milliseconds)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub reset_timeout_on_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_timeout: Option<u64>,
}

/// Configuration of one upstream backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Unique name; filled from the `mcpServers` key when loading a settings file
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openapi: Option<OpenApiSource>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Keep-alive ping interval in milliseconds (event-stream backends only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, ItemOverride>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub prompts: HashMap<String, ItemOverride>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl BackendConfig {
    fn with_kind(name: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            name: name.into(),
            kind,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            openapi: None,
            enabled: true,
            owner: None,
            keep_alive_interval: None,
            tools: HashMap::new(),
            prompts: HashMap::new(),
            options: RequestOptions::default(),
        }
    }

    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        let mut config = Self::with_kind(name, TransportKind::Stdio);
        config.command = Some(command.into());
        config.args = args;
        config
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::with_kind(name, TransportKind::Sse);
        config.url = Some(url.into());
        config
    }

    pub fn streamable_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::with_kind(name, TransportKind::StreamableHttp);
        config.url = Some(url.into());
        config
    }

    pub fn openapi(name: impl Into<String>, source: OpenApiSource) -> Self {
        let mut config = Self::with_kind(name, TransportKind::Openapi);
        config.openapi = Some(source);
        config
    }

    /// Keep-alive interval, or `default` when the backend does not set one
    pub fn keep_alive_or(&self, default: Duration) -> Duration {
        self.keep_alive_interval
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Override for a tool, looked up by namespaced name first and local name second
    pub fn tool_override(&self, namespaced: &str, local: &str) -> Option<&ItemOverride> {
        self.tools.get(namespaced).or_else(|| self.tools.get(local))
    }

    /// Override for a prompt, looked up the same way as tools
    pub fn prompt_override(&self, namespaced: &str, local: &str) -> Option<&ItemOverride> {
        self.prompts.get(namespaced).or_else(|| self.prompts.get(local))
    }
}

// =============================================================================
// Groups
// =============================================================================

/// Which tools of a backend a group exposes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolSelection {
    #[default]
    All,
    Only(Vec<String>),
}

impl ToolSelection {
    /// Whether the un-namespaced tool name passes this selection
    pub fn allows(&self, local_name: &str) -> bool {
        match self {
            ToolSelection::All => true,
            ToolSelection::Only(names) => names.iter().any(|n| n == local_name),
        }
    }
}

impl Serialize for ToolSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolSelection::All => serializer.serialize_str("all"),
            ToolSelection::Only(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ToolSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Keyword(String),
            Names(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Keyword(keyword) if keyword == "all" => Ok(ToolSelection::All),
            Raw::Keyword(other) => Err(serde::de::Error::custom(format!(
                "unknown tool selection '{other}', expected \"all\" or a list of tool names"
            ))),
            Raw::Names(names) => Ok(ToolSelection::Only(names)),
        }
    }
}

/// One backend entry inside a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupServer {
    pub name: String,
    #[serde(default)]
    pub tools: ToolSelection,
}

/// A named subset of backends and their tool selections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub servers: Vec<GroupServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl Group {
    pub fn server(&self, backend: &str) -> Option<&GroupServer> {
        self.servers.iter().find(|s| s.name == backend)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// Connection status shared by backends and endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Retry policy shared by upstream backends and downstream endpoints (milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Number of fast exponential attempts before switching tiers
    pub max_attempts: u32,
    pub initial_delay: u64,
    pub max_delay: u64,
    pub backoff_multiplier: f64,
    pub infinite_reconnect: bool,
    pub infinite_retry_delay: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: 2_000,
            max_delay: 60_000,
            backoff_multiplier: 2.0,
            infinite_reconnect: true,
            infinite_retry_delay: 1_800_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay)
    }

    pub fn infinite_retry_delay(&self) -> Duration {
        Duration::from_millis(self.infinite_retry_delay)
    }
}

/// An outbound real-time endpoint consuming the aggregated catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub web_socket_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub use_smart_routing: bool,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        web_socket_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            web_socket_url: web_socket_url.into(),
            description: None,
            group_id: None,
            use_smart_routing: false,
            reconnect: ReconnectPolicy::default(),
            status: ConnectionStatus::Disconnected,
            last_connected: None,
        }
    }
}

// =============================================================================
// System settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingSettings {
    /// Allow scope keys to name a group instead of its id
    pub enable_group_name_route: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            enable_group_name_route: true,
        }
    }
}

/// Package mirrors injected into process backends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_index_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npm_registry: Option<String>,
}

/// Smart routing toggle plus the opaque parameters of the similarity engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmartRoutingSettings {
    pub enabled: bool,
    #[serde(flatten)]
    pub engine: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelScopeSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointSettings {
    /// Global toggle for the endpoint bridge service
    pub enabled: bool,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemSettings {
    pub routing: RoutingSettings,
    pub install: InstallSettings,
    pub smart_routing: SmartRoutingSettings,
    pub modelscope: ModelScopeSettings,
    pub endpoints: EndpointSettings,
}
