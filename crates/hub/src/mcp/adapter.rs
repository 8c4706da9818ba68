//! Upstream adapters and the factory that builds them from a [`BackendConfig`]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcphub_shared::{BackendConfig, InstallSettings, SystemSettings, TransportKind};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::client::{CallOptions, McpClientError, McpResult, UpstreamClient};
use super::openapi::OpenApiAdapter;
use super::transport::{SseTransport, StdioTransport, StreamableHttpTransport, Transport};
use super::types::{Prompt, PromptGetResult, Tool, ToolCallResult};

/// Hosted inference domain whose servers take the configured bearer token
const MODELSCOPE_HOST: &str = "mcp.api-inference.modelscope.net";

const PYTHON_COMMANDS: &[&str] = &["uvx", "uv", "python"];
const NODE_COMMANDS: &[&str] = &["npm", "npx", "pnpm", "yarn", "node"];

/// A live connection to one upstream backend, whatever its transport
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn supports_tools(&self) -> bool {
        true
    }

    fn supports_prompts(&self) -> bool {
        false
    }

    async fn list_tools(&self) -> McpResult<Vec<Tool>>;

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>>;

    /// Call a tool by its local (unprefixed) name
    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult>;

    async fn get_prompt(&self, name: &str, arguments: Value) -> McpResult<PromptGetResult>;

    async fn ping(&self) -> McpResult<()>;

    /// Cancelled when the underlying connection goes away on its own
    fn closed(&self) -> CancellationToken;

    async fn close(&self);
}

/// Which timeout applies to the handshake and listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    /// First registration pass after boot
    Startup,
    /// Reconnects, re-enables and reloads
    Steady,
}

/// Builds adapters; swapped for scripted adapters in tests
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn connect(
        &self,
        config: &BackendConfig,
        settings: &SystemSettings,
        phase: ConnectPhase,
    ) -> McpResult<Arc<dyn UpstreamAdapter>>;
}

/// Factory for the real transports
pub struct DefaultAdapterFactory {
    http: reqwest::Client,
    init_timeout: Duration,
    request_timeout: Duration,
}

impl DefaultAdapterFactory {
    pub fn new(init_timeout: Duration, request_timeout: Duration) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            http,
            init_timeout,
            request_timeout,
        })
    }
}

#[async_trait]
impl AdapterFactory for DefaultAdapterFactory {
    async fn connect(
        &self,
        config: &BackendConfig,
        settings: &SystemSettings,
        phase: ConnectPhase,
    ) -> McpResult<Arc<dyn UpstreamAdapter>> {
        let calls = CallOptions::from_request_options(&config.options, self.request_timeout);
        let setup = match phase {
            ConnectPhase::Startup => CallOptions {
                timeout: self.init_timeout,
                ..calls.clone()
            },
            ConnectPhase::Steady => calls.clone(),
        };

        let transport: Box<dyn Transport> = match config.kind {
            TransportKind::Stdio => {
                let command = config.command.as_deref().ok_or_else(|| {
                    McpClientError::Configuration(format!(
                        "stdio backend {} has no command",
                        config.name
                    ))
                })?;
                let args: Vec<String> = config.args.iter().map(|a| expand_env_vars(a)).collect();
                let env = build_process_env(command, &config.env, &settings.install);
                Box::new(StdioTransport::spawn(&config.name, command, &args, &env)?)
            }
            TransportKind::Sse => {
                let url = require_url(config)?;
                let headers = build_headers(url, &config.headers, settings)?;
                Box::new(
                    SseTransport::connect(&config.name, self.http.clone(), url, headers, setup.timeout)
                        .await?,
                )
            }
            TransportKind::StreamableHttp => {
                let url = require_url(config)?;
                let headers = build_headers(url, &config.headers, settings)?;
                Box::new(StreamableHttpTransport::new(
                    &config.name,
                    self.http.clone(),
                    url,
                    headers,
                ))
            }
            TransportKind::Openapi => {
                let source_url = config
                    .openapi
                    .as_ref()
                    .and_then(|source| source.url.as_deref())
                    .unwrap_or_default();
                let headers = build_headers(source_url, &config.headers, settings)?;
                let adapter = OpenApiAdapter::load(
                    config,
                    self.http.clone(),
                    headers,
                    setup.timeout,
                    calls.timeout,
                )
                .await?;
                return Ok(Arc::new(adapter));
            }
        };

        let client = UpstreamClient::connect(&config.name, config.kind, transport, setup, calls).await?;
        Ok(Arc::new(client))
    }
}

fn require_url(config: &BackendConfig) -> McpResult<&str> {
    config
        .url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| {
            McpClientError::Configuration(format!(
                "{} backend {} has no url",
                config.kind, config.name
            ))
        })
}

/// Replace `${NAME}` with the value of the environment variable (empty when unset)
pub fn expand_env_vars(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        output.push_str(&rest[..start]);
        let name = &rest[start + 2..start + 2 + len];
        output.push_str(&std::env::var(name).unwrap_or_default());
        rest = &rest[start + 2 + len + 1..];
    }

    output.push_str(rest);
    output
}

/// Environment overrides for a stdio child: the backend's own `env` (expanded) plus
/// package mirror variables for known installers
pub fn build_process_env(
    command: &str,
    env: &HashMap<String, String>,
    install: &InstallSettings,
) -> HashMap<String, String> {
    let mut result: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect();

    if let Some(index) = install.python_index_url.as_deref().filter(|s| !s.is_empty()) {
        if PYTHON_COMMANDS.contains(&command) {
            result.insert("UV_DEFAULT_INDEX".to_string(), index.to_string());
        }
    }
    if let Some(registry) = install.npm_registry.as_deref().filter(|s| !s.is_empty()) {
        if NODE_COMMANDS.contains(&command) {
            result.insert("npm_config_registry".to_string(), registry.to_string());
        }
    }

    result
}

/// Configured headers (expanded) plus the hosted-inference bearer token when applicable
pub fn build_headers(
    url: &str,
    headers: &HashMap<String, String>,
    settings: &SystemSettings,
) -> McpResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpClientError::Configuration(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(&expand_env_vars(value))
            .map_err(|e| McpClientError::Configuration(format!("invalid value for header {}: {}", name, e)))?;
        map.insert(name, value);
    }

    let token = settings.modelscope.api_key.as_deref().filter(|k| !k.is_empty());
    if let Some(token) = token {
        if url.contains(MODELSCOPE_HOST) && !map.contains_key(AUTHORIZATION) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| McpClientError::Configuration(format!("invalid bearer token: {}", e)))?;
            map.insert(AUTHORIZATION, value);
        }
    }

    Ok(map)
}
