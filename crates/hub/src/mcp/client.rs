//! MCP Client for Upstream Connections
//!
//! [`UpstreamClient`] speaks MCP over any [`Transport`]: it performs the
//! initialize handshake, numbers requests, applies request timeouts and
//! unwraps JSON-RPC results into typed values.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mcphub_shared::{RequestOptions, TransportKind};
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::adapter::UpstreamAdapter;
use super::transport::Transport;
use super::types::*;

/// Upper bound on pages fetched from a paginated listing
const MAX_LIST_PAGES: usize = 100;

/// Error type for MCP client operations
#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Error POSTing to endpoint (HTTP {status}): {body}")]
    HttpStatus { status: u16, body: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("MCP server returned error: {0}")]
    McpError(String),

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Process spawn failed: {0}")]
    ProcessError(String),

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Connection closed")]
    Closed,

    #[error("Backend not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl McpClientError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            McpClientError::HttpError(_) => true,
            McpClientError::HttpStatus { status, .. } => *status >= 500,
            McpClientError::Timeout => true,
            McpClientError::IoError(_) => true,
            McpClientError::Stream(_) => true,
            McpClientError::Closed => true,
            McpClientError::NotConnected => true,

            McpClientError::McpError(_) => false,
            McpClientError::JsonError(_) => false,
            McpClientError::InvalidResponse => false,
            McpClientError::ProcessError(_) => false,
            McpClientError::Configuration(_) => false,
        }
    }

    /// A 4xx answer to a protocol POST (expired session, rotated credentials, ...)
    pub fn is_client_http_error(&self) -> bool {
        matches!(self, McpClientError::HttpStatus { status, .. } if (400..500).contains(status))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, McpClientError::Configuration(_))
    }
}

/// Result type for MCP client operations
pub type McpResult<T> = Result<T, McpClientError>;

/// Timeout behaviour for one request
#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    pub timeout: Duration,
    /// Progress notifications for the request restart the timeout
    pub reset_on_progress: bool,
    /// Hard cap on the total wait, progress or not
    pub max_total: Option<Duration>,
}

impl CallOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            reset_on_progress: false,
            max_total: None,
        }
    }

    /// Merge a backend's request options over a default timeout
    pub fn from_request_options(options: &RequestOptions, default_timeout: Duration) -> Self {
        Self {
            timeout: options
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
            reset_on_progress: options.reset_timeout_on_progress,
            max_total: options.max_total_timeout.map(Duration::from_millis),
        }
    }

    fn deadline_from(&self, started: Instant, now: Instant) -> Instant {
        let deadline = now + self.timeout;
        match self.max_total {
            Some(max) => deadline.min(started + max),
            None => deadline,
        }
    }
}

/// MCP session with one upstream backend
pub struct UpstreamClient {
    backend: String,
    kind: TransportKind,
    transport: Box<dyn Transport>,
    next_id: AtomicI64,
    server: InitializeResult,
    /// Used for listings
    setup: CallOptions,
    /// Used for tool calls, prompt fetches and pings
    calls: CallOptions,
}

impl UpstreamClient {
    /// Run the initialize handshake over `transport`
    pub async fn connect(
        backend: impl Into<String>,
        kind: TransportKind,
        transport: Box<dyn Transport>,
        setup: CallOptions,
        calls: CallOptions,
    ) -> McpResult<Self> {
        let backend = backend.into();
        let params = serde_json::to_value(InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities::default(),
            client_info: Implementation {
                name: format!("mcphub-client-{}", backend),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })?;

        let request = JsonRpcRequest::new(0, "initialize", Some(params));
        let response = await_response(transport.as_ref(), request, &setup).await;
        let result = match response.and_then(into_result) {
            Ok(result) => result,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };
        let server: InitializeResult = serde_json::from_value(result)?;

        transport
            .notify(JsonRpcRequest::notification("notifications/initialized", None))
            .await?;

        tracing::info!(
            backend = %backend,
            transport = %kind,
            server = %server.server_info.name,
            server_version = %server.server_info.version,
            "Upstream MCP initialized"
        );

        Ok(Self {
            backend,
            kind,
            transport,
            next_id: AtomicI64::new(1),
            server,
            setup,
            calls,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn server_info(&self) -> &InitializeResult {
        &self.server
    }

    async fn send(&self, method: &str, params: Value, options: &CallOptions) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut params = params;
        if options.reset_on_progress {
            if let Some(object) = params.as_object_mut() {
                object.insert("_meta".to_string(), json!({ "progressToken": id }));
            }
        }

        let request = JsonRpcRequest::new(id, method, Some(params));
        let response = await_response(self.transport.as_ref(), request, options).await?;
        into_result(response)
    }

    async fn list_all<T, R>(
        &self,
        method: &str,
        extract: impl Fn(R) -> (Vec<T>, Option<String>),
    ) -> McpResult<Vec<T>>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result: R = serde_json::from_value(self.send(method, params, &self.setup).await?)?;
            let (page, next) = extract(result);
            items.extend(page);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }

        tracing::warn!(backend = %self.backend, method, "Listing exceeded page limit, truncating");
        Ok(items)
    }
}

#[async_trait]
impl UpstreamAdapter for UpstreamClient {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_tools(&self) -> bool {
        self.server.capabilities.tools.is_some()
    }

    fn supports_prompts(&self) -> bool {
        self.server.capabilities.prompts.is_some()
    }

    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        let tools = self
            .list_all("tools/list", |r: ToolsListResult| (r.tools, r.next_cursor))
            .await?;
        Ok(tools
            .into_iter()
            .map(|mut tool| {
                tool.input_schema = clean_input_schema(tool.input_schema);
                tool
            })
            .collect())
    }

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.list_all("prompts/list", |r: PromptsListResult| (r.prompts, r.next_cursor))
            .await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments,
        })?;
        let result = self.send("tools/call", params, &self.calls).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_prompt(&self, name: &str, arguments: Value) -> McpResult<PromptGetResult> {
        let params = serde_json::to_value(PromptGetParams {
            name: name.to_string(),
            arguments,
        })?;
        let result = self.send("prompts/get", params, &self.calls).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn ping(&self) -> McpResult<()> {
        self.send("ping", json!({}), &self.calls).await.map(|_| ())
    }

    fn closed(&self) -> CancellationToken {
        self.transport.closed()
    }

    async fn close(&self) {
        tracing::debug!(backend = %self.backend, "Closing upstream client");
        self.transport.close().await;
    }
}

fn into_result(response: JsonRpcResponse) -> McpResult<Value> {
    if let Some(error) = response.error {
        return Err(McpClientError::McpError(error.message));
    }
    response.result.ok_or(McpClientError::InvalidResponse)
}

/// Wait for a response, restarting the timeout on matching progress notifications
async fn await_response(
    transport: &dyn Transport,
    request: JsonRpcRequest,
    options: &CallOptions,
) -> McpResult<JsonRpcResponse> {
    let token = request.id.as_ref().and_then(JsonRpcId::as_i64);
    let mut progress = if options.reset_on_progress {
        transport.progress()
    } else {
        None
    };

    let started = Instant::now();
    let mut deadline = options.deadline_from(started, started);
    let response = transport.request(request);
    tokio::pin!(response);

    loop {
        tokio::select! {
            result = &mut response => return result,
            _ = tokio::time::sleep_until(deadline) => return Err(McpClientError::Timeout),
            update = next_progress(&mut progress) => {
                let matches = token.is_some()
                    && update.get("progressToken").and_then(Value::as_i64) == token;
                if matches {
                    deadline = options.deadline_from(started, Instant::now());
                }
            }
        }
    }
}

async fn next_progress(rx: &mut Option<broadcast::Receiver<Value>>) -> Value {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(update) => return update,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted transport: answers by method name, optionally after a delay
    pub(crate) struct ScriptedTransport {
        pub answers: Mutex<Vec<(String, Value)>>,
        pub delay: Duration,
        pub progress: broadcast::Sender<Value>,
        pub sent: Mutex<Vec<JsonRpcRequest>>,
        pub closed: CancellationToken,
    }

    impl ScriptedTransport {
        pub fn new(answers: Vec<(&str, Value)>) -> Self {
            Self {
                answers: Mutex::new(
                    answers
                        .into_iter()
                        .map(|(m, v)| (m.to_string(), v))
                        .collect(),
                ),
                delay: Duration::ZERO,
                progress: broadcast::channel(16).0,
                sent: Mutex::new(Vec::new()),
                closed: CancellationToken::new(),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
            self.sent.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;
            let answer = {
                let mut answers = self.answers.lock().unwrap();
                let idx = answers.iter().position(|(m, _)| *m == request.method);
                idx.map(|i| answers.remove(i).1)
            };
            match answer {
                Some(result) => Ok(JsonRpcResponse::success(request.id, result)),
                None => Ok(JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::method_not_found(&request.method),
                )),
            }
        }

        async fn notify(&self, notification: JsonRpcRequest) -> McpResult<()> {
            self.sent.lock().unwrap().push(notification);
            Ok(())
        }

        fn progress(&self) -> Option<broadcast::Receiver<Value>> {
            Some(self.progress.subscribe())
        }

        fn closed(&self) -> CancellationToken {
            self.closed.clone()
        }

        async fn close(&self) {
            self.closed.cancel();
        }
    }

    fn init_result() -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fetch", "version": "1.0.0"}
        })
    }

    fn quick() -> CallOptions {
        CallOptions::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_connect_and_list_tools_strips_schema_marker() {
        let transport = ScriptedTransport::new(vec![
            ("initialize", init_result()),
            (
                "tools/list",
                json!({
                    "tools": [{"name": "get", "inputSchema": {"$schema": "x", "type": "object"}}],
                    "nextCursor": "page-2"
                }),
            ),
            (
                "tools/list",
                json!({"tools": [{"name": "head", "inputSchema": {"type": "object"}}]}),
            ),
        ]);

        let client = UpstreamClient::connect(
            "fetch",
            TransportKind::Stdio,
            Box::new(transport),
            quick(),
            quick(),
        )
        .await
        .unwrap();

        assert!(client.supports_tools());
        assert!(!client.supports_prompts());

        let tools = client.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["get", "head"]);
        assert!(tools[0].input_schema.get("$schema").is_none());
    }

    #[tokio::test]
    async fn test_upstream_error_is_surfaced() {
        let transport = ScriptedTransport::new(vec![("initialize", init_result())]);
        let client = UpstreamClient::connect(
            "fetch",
            TransportKind::Stdio,
            Box::new(transport),
            quick(),
            quick(),
        )
        .await
        .unwrap();

        let err = client.call_tool("get", json!({})).await.unwrap_err();
        assert!(matches!(err, McpClientError::McpError(msg) if msg.contains("tools/call")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let mut transport = ScriptedTransport::new(vec![("initialize", init_result())]);
        transport.delay = Duration::from_secs(30);

        let result = UpstreamClient::connect(
            "slow",
            TransportKind::Stdio,
            Box::new(transport),
            CallOptions::new(Duration::from_secs(1)),
            quick(),
        )
        .await;

        assert!(matches!(result, Err(McpClientError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_timeout_until_max_total() {
        let mut transport = ScriptedTransport::new(vec![]);
        transport.delay = Duration::from_secs(3);
        let progress = transport.progress.clone();

        let options = CallOptions {
            timeout: Duration::from_secs(2),
            reset_on_progress: true,
            max_total: None,
        };
        let request = JsonRpcRequest::new(9, "tools/call", Some(json!({})));

        let ticker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let _ = progress.send(json!({"progressToken": 9, "progress": 1}));
        });

        // 3s of work, timeout of 2s, but a progress update at 1.5s pushes the deadline to 3.5s
        let response = await_response(&transport, request, &options).await.unwrap();
        assert!(response.error.is_some());
        ticker.await.unwrap();

        let capped = CallOptions {
            max_total: Some(Duration::from_millis(2500)),
            ..options
        };
        let progress = transport.progress.clone();
        let ticker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let _ = progress.send(json!({"progressToken": 10, "progress": 1}));
        });
        let request = JsonRpcRequest::new(10, "tools/call", Some(json!({})));
        let result = await_response(&transport, request, &capped).await;
        assert!(matches!(result, Err(McpClientError::Timeout)));
        ticker.await.unwrap();
    }

    #[test]
    fn test_call_options_from_request_options() {
        let options = RequestOptions {
            timeout: Some(1_500),
            reset_timeout_on_progress: true,
            max_total_timeout: Some(10_000),
        };
        let call = CallOptions::from_request_options(&options, Duration::from_secs(60));
        assert_eq!(call.timeout, Duration::from_millis(1_500));
        assert!(call.reset_on_progress);
        assert_eq!(call.max_total, Some(Duration::from_secs(10)));

        let defaulted = CallOptions::from_request_options(&RequestOptions::default(), Duration::from_secs(60));
        assert_eq!(defaulted.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_client_http_error_classification() {
        let unauthorized = McpClientError::HttpStatus {
            status: 401,
            body: "expired".into(),
        };
        assert!(unauthorized.is_client_http_error());
        assert!(!unauthorized.is_transient());
        assert!(unauthorized.to_string().starts_with("Error POSTing to endpoint (HTTP 40"));

        let unavailable = McpClientError::HttpStatus {
            status: 503,
            body: String::new(),
        };
        assert!(!unavailable.is_client_http_error());
        assert!(unavailable.is_transient());
    }
}
