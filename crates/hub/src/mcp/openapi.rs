//! OpenAPI-described HTTP services exposed as MCP tools.
//!
//! Each operation in the document becomes one tool. Path, query and header
//! parameters map to top-level properties of the tool's input schema; a JSON
//! request body is passed under `body`.

use std::time::Duration;

use async_trait::async_trait;
use mcphub_shared::{BackendConfig, TransportKind};
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::adapter::UpstreamAdapter;
use super::client::{McpClientError, McpResult};
use super::types::{Prompt, PromptGetResult, Tool, ToolCallResult};

const HTTP_METHODS: &[&str] = &["get", "put", "post", "delete", "patch", "head", "options"];
const FETCH_RETRIES: usize = 3;
const MAX_REF_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamLocation {
    Path,
    Query,
    Header,
}

#[derive(Debug, Clone)]
struct Param {
    name: String,
    location: ParamLocation,
}

#[derive(Debug, Clone)]
struct Operation {
    tool: Tool,
    method: Method,
    path: String,
    params: Vec<Param>,
    has_body: bool,
}

pub struct OpenApiAdapter {
    backend: String,
    http: reqwest::Client,
    base_url: Url,
    headers: HeaderMap,
    operations: Vec<Operation>,
    call_timeout: Duration,
    closed: CancellationToken,
}

impl OpenApiAdapter {
    /// Load the document (inline or fetched) and synthesize one tool per operation
    pub async fn load(
        config: &BackendConfig,
        http: reqwest::Client,
        headers: HeaderMap,
        fetch_timeout: Duration,
        call_timeout: Duration,
    ) -> McpResult<Self> {
        let source = config.openapi.as_ref().ok_or_else(|| {
            McpClientError::Configuration(format!("openapi backend {} has no openapi source", config.name))
        })?;

        let document = match (&source.schema, &source.url) {
            (Some(schema), _) => schema.clone(),
            (None, Some(url)) => fetch_document(&http, url, &headers, fetch_timeout).await?,
            (None, None) => {
                return Err(McpClientError::Configuration(format!(
                    "openapi backend {} needs either openapi.url or openapi.schema",
                    config.name
                )))
            }
        };

        let base_url = resolve_base_url(&document, source.url.as_deref())?;
        let operations = synthesize_operations(&document)?;

        tracing::info!(
            backend = %config.name,
            base_url = %base_url,
            operations = operations.len(),
            "OpenAPI document loaded"
        );

        Ok(Self {
            backend: config.name.clone(),
            http,
            base_url,
            headers,
            operations,
            call_timeout,
            closed: CancellationToken::new(),
        })
    }

    fn build_url(&self, operation: &Operation, arguments: &Map<String, Value>) -> McpResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                McpClientError::Configuration(format!("base url {} cannot carry a path", self.base_url))
            })?;
            segments.pop_if_empty();
            for segment in operation.path.split('/').filter(|s| !s.is_empty()) {
                let mut filled = segment.to_string();
                for param in operation.params.iter().filter(|p| p.location == ParamLocation::Path) {
                    let placeholder = format!("{{{}}}", param.name);
                    if filled.contains(&placeholder) {
                        let value = arguments.get(&param.name).map(param_string).ok_or_else(|| {
                            McpClientError::McpError(format!("missing path parameter {}", param.name))
                        })?;
                        filled = filled.replace(&placeholder, &value);
                    }
                }
                segments.push(&filled);
            }
        }

        let query: Vec<(&str, String)> = operation
            .params
            .iter()
            .filter(|p| p.location == ParamLocation::Query)
            .filter_map(|p| arguments.get(&p.name).map(|v| (p.name.as_str(), param_string(v))))
            .collect();
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, &value);
            }
        }

        Ok(url)
    }
}

async fn fetch_document(
    http: &reqwest::Client,
    url: &str,
    headers: &HeaderMap,
    timeout: Duration,
) -> McpResult<Value> {
    let retry_strategy = ExponentialBackoff::from_millis(200)
        .max_delay(Duration::from_secs(2))
        .take(FETCH_RETRIES)
        .map(jitter);

    let body = Retry::spawn(retry_strategy, || async {
        let result: McpResult<String> = async {
            let response = http
                .get(url)
                .headers(headers.clone())
                .timeout(timeout)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(McpClientError::HttpStatus {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(body)
        }
        .await;

        match &result {
            Ok(_) => Ok(result),
            Err(e) if e.is_transient() => {
                tracing::debug!(url = %url, error = %e, "Transient error fetching OpenAPI document - will retry");
                Err(result)
            }
            Err(_) => Ok(result),
        }
    })
    .await
    .unwrap_or_else(|e| e)?;

    parse_document(&body)
}

/// Accept JSON or YAML
fn parse_document(body: &str) -> McpResult<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }
    serde_yaml::from_str::<Value>(body)
        .map_err(|e| McpClientError::Configuration(format!("malformed OpenAPI document: {}", e)))
}

fn resolve_base_url(document: &Value, document_url: Option<&str>) -> McpResult<Url> {
    let document_url = document_url.and_then(|u| Url::parse(u).ok());
    let server = document.pointer("/servers/0");

    let Some(server) = server else {
        return document_url
            .and_then(|u| u.join("/").ok())
            .ok_or_else(|| McpClientError::Configuration("OpenAPI document has no servers".to_string()));
    };

    let mut raw = server
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or("/")
        .to_string();
    if let Some(variables) = server.get("variables").and_then(Value::as_object) {
        for (name, variable) in variables {
            if let Some(default) = variable.get("default").and_then(Value::as_str) {
                raw = raw.replace(&format!("{{{}}}", name), default);
            }
        }
    }

    match Url::parse(&raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => document_url
            .and_then(|base| base.join(&raw).ok())
            .ok_or_else(|| McpClientError::Configuration(format!("relative server url {} without a document url", raw))),
        Err(e) => Err(McpClientError::Configuration(format!("invalid server url {}: {}", raw, e))),
    }
}

/// Follow local `$ref` pointers (`#/components/...`)
fn resolve_ref<'a>(document: &'a Value, mut value: &'a Value) -> &'a Value {
    for _ in 0..MAX_REF_DEPTH {
        let Some(pointer) = value.get("$ref").and_then(Value::as_str) else {
            return value;
        };
        match pointer.strip_prefix('#').and_then(|p| document.pointer(p)) {
            Some(target) => value = target,
            None => return value,
        }
    }
    value
}

/// `get /pets/{id}` → `get_pets_id`
fn operation_name(method: &str, path: &str) -> String {
    let raw = format!("{}_{}", method, path);
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
        } else if !name.ends_with('_') {
            name.push('_');
        }
    }
    name.trim_matches('_').to_string()
}

fn synthesize_operations(document: &Value) -> McpResult<Vec<Operation>> {
    let paths = document
        .get("paths")
        .and_then(Value::as_object)
        .ok_or_else(|| McpClientError::Configuration("OpenAPI document has no paths".to_string()))?;

    let mut operations = Vec::new();
    for (path, item) in paths {
        let item = resolve_ref(document, item);
        let shared_params = item.get("parameters").and_then(Value::as_array);

        for method in HTTP_METHODS {
            let Some(op) = item.get(*method) else {
                continue;
            };

            let mut properties = Map::new();
            let mut required: Vec<Value> = Vec::new();
            let mut params = Vec::new();

            let op_params = op.get("parameters").and_then(Value::as_array);
            for raw in shared_params.into_iter().flatten().chain(op_params.into_iter().flatten()) {
                let param = resolve_ref(document, raw);
                let Some(name) = param.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let location = match param.get("in").and_then(Value::as_str) {
                    Some("path") => ParamLocation::Path,
                    Some("query") => ParamLocation::Query,
                    Some("header") => ParamLocation::Header,
                    _ => continue,
                };

                let mut schema = param
                    .get("schema")
                    .map(|s| resolve_ref(document, s).clone())
                    .unwrap_or_else(|| json!({"type": "string"}));
                if let (Some(obj), Some(desc)) = (schema.as_object_mut(), param.get("description")) {
                    obj.entry("description").or_insert_with(|| desc.clone());
                }

                let is_required = location == ParamLocation::Path
                    || param.get("required").and_then(Value::as_bool).unwrap_or(false);
                if is_required && !required.iter().any(|r| r == name) {
                    required.push(Value::String(name.to_string()));
                }

                // Operation-level parameters override path-level ones with the same name
                params.retain(|p: &Param| p.name != name);
                params.push(Param {
                    name: name.to_string(),
                    location,
                });
                properties.insert(name.to_string(), schema);
            }

            let mut has_body = false;
            if let Some(body) = op.get("requestBody").map(|b| resolve_ref(document, b)) {
                if let Some(schema) = body.pointer("/content/application~1json/schema") {
                    has_body = true;
                    properties.insert("body".to_string(), resolve_ref(document, schema).clone());
                    if body.get("required").and_then(Value::as_bool).unwrap_or(false) {
                        required.push(Value::String("body".to_string()));
                    }
                }
            }

            let name = op
                .get("operationId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| operation_name(method, path));
            let description = op
                .get("summary")
                .or_else(|| op.get("description"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let mut input_schema = json!({"type": "object", "properties": properties});
            if !required.is_empty() {
                input_schema["required"] = Value::Array(required);
            }

            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|e| McpClientError::Configuration(e.to_string()))?;

            operations.push(Operation {
                tool: Tool::new(name, description, input_schema),
                method,
                path: path.clone(),
                params,
                has_body,
            });
        }
    }

    Ok(operations)
}

fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl UpstreamAdapter for OpenApiAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Openapi
    }

    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        Ok(self.operations.iter().map(|op| op.tool.clone()).collect())
    }

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        if self.closed.is_cancelled() {
            return Err(McpClientError::Closed);
        }
        let operation = self
            .operations
            .iter()
            .find(|op| op.tool.name == name)
            .ok_or_else(|| McpClientError::McpError(format!("Unknown operation: {}", name)))?;

        let arguments = arguments.as_object().cloned().unwrap_or_default();
        let url = self.build_url(operation, &arguments)?;

        let mut request = self
            .http
            .request(operation.method.clone(), url)
            .headers(self.headers.clone())
            .timeout(self.call_timeout);
        for param in operation.params.iter().filter(|p| p.location == ParamLocation::Header) {
            if let Some(value) = arguments.get(&param.name) {
                request = request.header(param.name.as_str(), param_string(value));
            }
        }
        if operation.has_body {
            if let Some(body) = arguments.get("body") {
                request = request.json(body);
            }
        }

        tracing::debug!(backend = %self.backend, operation = %name, method = %operation.method, "Calling OpenAPI operation");

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let text = match serde_json::from_str::<Value>(&body) {
            Ok(json) => serde_json::to_string_pretty(&json)?,
            Err(_) => body,
        };

        if status.is_success() {
            Ok(ToolCallResult::text(text))
        } else {
            Ok(ToolCallResult::error(format!("HTTP {}: {}", status.as_u16(), text)))
        }
    }

    async fn get_prompt(&self, name: &str, _arguments: Value) -> McpResult<PromptGetResult> {
        Err(McpClientError::McpError(format!("Prompt not found: {}", name)))
    }

    async fn ping(&self) -> McpResult<()> {
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
