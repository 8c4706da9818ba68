//! Scripted upstream backends for integration tests

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcphub::mcp::manager::{BackendManager, ManagerSettings};
use mcphub::mcp::{
    AdapterFactory, ConnectPhase, InMemoryToolSearch, McpClientError, McpResult, McpRouter, Prompt,
    PromptGetResult, Tool, ToolCallResult, UpstreamAdapter,
};
use mcphub::reconnect::ReconnectLimits;
use mcphub_shared::{BackendConfig, ConnectionStatus, MemoryConfigStore, ReconnectPolicy, SystemSettings, TransportKind};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// What a scripted backend exposes (local names)
#[derive(Clone, Default)]
pub struct Script {
    pub tools: Vec<(String, String)>,
    pub prompts: Vec<String>,
    /// Connect attempts that fail before one succeeds
    pub failures: usize,
    /// Connects launched with this command take this long
    pub slow_command: Option<(String, Duration)>,
    /// Tool calls answered with HTTP 401 before calls succeed, shared by every
    /// adapter of the backend
    pub rejected_calls: Arc<AtomicUsize>,
}

impl Script {
    pub fn tools(tools: &[(&str, &str)]) -> Self {
        Self {
            tools: tools
                .iter()
                .map(|(name, description)| (name.to_string(), description.to_string()))
                .collect(),
            ..Default::default()
        }
    }
}

pub struct MockAdapter {
    pub backend: String,
    pub command: Option<String>,
    kind: TransportKind,
    script: Script,
    closed: CancellationToken,
    calls: AtomicUsize,
    pings: AtomicUsize,
}

impl MockAdapter {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamAdapter for MockAdapter {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_prompts(&self) -> bool {
        !self.script.prompts.is_empty()
    }

    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        Ok(self
            .script
            .tools
            .iter()
            .map(|(name, description)| {
                Tool::new(
                    name.clone(),
                    description.clone(),
                    json!({"$schema": "http://json-schema.org/draft-07/schema#", "type": "object"}),
                )
            })
            .collect())
    }

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        Ok(self
            .script
            .prompts
            .iter()
            .map(|name| Prompt {
                name: name.clone(),
                description: Some(format!("{} prompt", name)),
                arguments: None,
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.is_cancelled() {
            return Err(McpClientError::Closed);
        }
        let rejected = self
            .script
            .rejected_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(McpClientError::HttpStatus {
                status: 401,
                body: "session expired".to_string(),
            });
        }
        Ok(ToolCallResult::text(format!("{}:{}:{}", self.backend, name, arguments)))
    }

    async fn get_prompt(&self, name: &str, _arguments: Value) -> McpResult<PromptGetResult> {
        Ok(PromptGetResult {
            description: Some(format!("{}:{}", self.backend, name)),
            messages: Vec::new(),
        })
    }

    async fn ping(&self) -> McpResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Factory handing out [`MockAdapter`]s per backend name
#[derive(Default)]
pub struct MockFactory {
    scripts: Mutex<HashMap<String, Script>>,
    connects: Mutex<HashMap<String, usize>>,
    adapters: Mutex<Vec<Arc<MockAdapter>>>,
}

impl MockFactory {
    pub fn new(scripts: Vec<(&str, Script)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(name, script)| (name.to_string(), script))
                    .collect(),
            ),
            ..Default::default()
        })
    }

    pub fn connects(&self, backend: &str) -> usize {
        self.connects.lock().unwrap().get(backend).copied().unwrap_or(0)
    }

    /// Every adapter handed out for `backend`, oldest first
    pub fn adapters(&self, backend: &str) -> Vec<Arc<MockAdapter>> {
        self.adapters
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.backend == backend)
            .cloned()
            .collect()
    }

    /// Change what later connects to `backend` will expose
    pub fn update_script(&self, backend: &str, f: impl FnOnce(&mut Script)) {
        if let Some(script) = self.scripts.lock().unwrap().get_mut(backend) {
            f(script);
        }
    }

    /// Simulate the upstream dropping the connection
    pub fn drop_connection(&self, backend: &str) {
        if let Some(adapter) = self.adapters(backend).last() {
            adapter.closed.cancel();
        }
    }
}

#[async_trait]
impl AdapterFactory for MockFactory {
    async fn connect(
        &self,
        config: &BackendConfig,
        _settings: &SystemSettings,
        _phase: ConnectPhase,
    ) -> McpResult<Arc<dyn UpstreamAdapter>> {
        *self
            .connects
            .lock()
            .unwrap()
            .entry(config.name.clone())
            .or_insert(0) += 1;

        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            let Some(script) = scripts.get_mut(&config.name) else {
                return Err(McpClientError::ProcessError(format!("{} is not installed", config.name)));
            };
            if script.failures > 0 {
                script.failures -= 1;
                return Err(McpClientError::Closed);
            }
            script.clone()
        };

        if let Some((command, delay)) = &script.slow_command {
            if config.command.as_ref() == Some(command) {
                tokio::time::sleep(*delay).await;
            }
        }

        let adapter = Arc::new(MockAdapter {
            backend: config.name.clone(),
            command: config.command.clone(),
            kind: config.kind,
            script,
            closed: CancellationToken::new(),
            calls: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        });
        self.adapters.lock().unwrap().push(Arc::clone(&adapter));
        Ok(adapter)
    }
}

/// Small delays so retry tests finish quickly under paused time
pub fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            initial_delay: 100,
            max_delay: 1_000,
            backoff_multiplier: 2.0,
            infinite_reconnect: false,
            infinite_retry_delay: 5_000,
        },
        limits: ReconnectLimits::default(),
        keep_alive: Duration::from_secs(60),
    }
}

pub fn store(json: Value) -> Arc<MemoryConfigStore> {
    Arc::new(MemoryConfigStore::from_json(&json.to_string()).unwrap())
}

pub fn manager(store: Arc<MemoryConfigStore>, factory: Arc<MockFactory>) -> Arc<BackendManager> {
    BackendManager::new(
        store,
        factory,
        Arc::new(InMemoryToolSearch::new()),
        fast_settings(),
    )
}

pub fn router(manager: &Arc<BackendManager>) -> McpRouter {
    McpRouter::new(Arc::clone(manager))
}

pub fn tool_names(tools: &[Tool]) -> Vec<String> {
    tools.iter().map(|t| t.name.clone()).collect()
}

/// Poll until `backend` reaches `status` (auto-advances under paused time)
pub async fn wait_for_status(manager: &BackendManager, backend: &str, status: ConnectionStatus) {
    for _ in 0..200 {
        if manager.catalog().get(backend).is_some_and(|rt| rt.status == status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never reached {}", backend, status);
}

/// weather + units + fetch, with one hidden tool and one description override
pub fn standard_settings() -> Value {
    json!({
        "mcpServers": {
            "weather": {"command": "weather-mcp"},
            "units": {
                "command": "units-mcp",
                "tools": {
                    "temperature_table": {"enabled": false},
                    "units-convert_temperature": {"description": "Convert temperatures (Celsius, Fahrenheit, Kelvin)"}
                }
            },
            "fetch": {"command": "uvx", "args": ["mcp-server-fetch"]}
        },
        "groups": [
            {
                "id": "g1",
                "name": "outdoors",
                "servers": [{"name": "weather", "tools": "all"}]
            },
            {
                "id": "g2",
                "name": "convert-only",
                "servers": [{"name": "units", "tools": ["convert_temperature"]}]
            }
        ],
        "systemConfig": {
            "smartRouting": {"enabled": true}
        }
    })
}

pub fn standard_factory() -> Arc<MockFactory> {
    MockFactory::new(vec![
        (
            "weather",
            Script::tools(&[
                ("forecast", "Get the weather forecast for a city"),
                ("alerts", "Active severe weather alerts for a region"),
            ]),
        ),
        (
            "units",
            Script::tools(&[
                ("convert_temperature", "Convert a temperature between units"),
                ("temperature_table", "Temperature conversion reference table"),
                ("convert_length", "Convert a length between metres and feet"),
            ]),
        ),
        (
            "fetch",
            Script {
                prompts: vec!["summarize".to_string()],
                ..Script::tools(&[("fetch", "Fetch a URL and return its body")])
            },
        ),
    ])
}
