//! JSON-RPC dispatch for downstream MCP sessions
//!
//! The same handler serves the HTTP endpoint, local WebSocket sessions and the
//! endpoint bridge. What differs is the [`SessionKind`]: the bridge announces
//! itself under its own name, advertises tools only, and silently drops
//! methods it does not know instead of answering with an error.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::router::{McpRouter, Scope};
use super::types::*;

/// Server name announced to endpoint consumers
pub const BRIDGE_SERVER_NAME: &str = "mcphub-endpoint-bridge";

/// Server name announced to local sessions
pub const HUB_SERVER_NAME: &str = "mcphub";

/// Types of MCP methods the hub answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpMethod {
    Initialize,
    Ping,
    ToolsList,
    ToolsCall,
    PromptsList,
    PromptsGet,
    Unknown,
}

impl McpMethod {
    pub fn from_name(method: &str) -> Self {
        match method {
            "initialize" => McpMethod::Initialize,
            "ping" => McpMethod::Ping,
            "tools/list" => McpMethod::ToolsList,
            "tools/call" => McpMethod::ToolsCall,
            "prompts/list" => McpMethod::PromptsList,
            "prompts/get" => McpMethod::PromptsGet,
            _ => McpMethod::Unknown,
        }
    }

    /// Methods that smart routing intercepts
    pub fn is_tool_method(&self) -> bool {
        matches!(self, McpMethod::ToolsList | McpMethod::ToolsCall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// HTTP and WebSocket clients of the hub itself
    Local,
    /// Remote consumers reached through an endpoint bridge
    Bridge,
}

pub struct McpRequestHandler {
    router: Arc<McpRouter>,
    kind: SessionKind,
}

impl McpRequestHandler {
    pub fn new(router: Arc<McpRouter>, kind: SessionKind) -> Self {
        Self { router, kind }
    }

    pub fn router(&self) -> &Arc<McpRouter> {
        &self.router
    }

    fn initialize_result(&self) -> InitializeResult {
        let (name, capabilities) = match self.kind {
            SessionKind::Local => (HUB_SERVER_NAME, Capabilities::hub()),
            SessionKind::Bridge => (
                BRIDGE_SERVER_NAME,
                Capabilities {
                    tools: Some(ListCapability::default()),
                    ..Default::default()
                },
            ),
        };

        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities,
            server_info: Implementation {
                name: name.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: None,
        }
    }

    /// Answer one request. Notifications (and, for bridges, unknown methods)
    /// produce no response.
    pub async fn handle(&self, request: JsonRpcRequest, scope: &Scope) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            tracing::debug!(method = %request.method, "Ignoring notification");
            return None;
        }

        let id = request.id.clone();
        let method = McpMethod::from_name(&request.method);

        let outcome = match method {
            McpMethod::Initialize => to_value(self.initialize_result()),
            McpMethod::Ping => Ok(json!({})),
            McpMethod::ToolsList => to_value(ToolsListResult {
                tools: self.router.list_tools(scope),
                next_cursor: None,
            }),
            McpMethod::ToolsCall => match parse_params::<ToolCallParams>(request.params) {
                Ok(params) => {
                    let arguments = object_or_empty(params.arguments);
                    let result = self.router.call_tool(&params.name, arguments, scope).await;
                    to_value(result)
                }
                Err(e) => Err(e),
            },
            McpMethod::PromptsList => to_value(PromptsListResult {
                prompts: self.router.list_prompts(scope),
                next_cursor: None,
            }),
            McpMethod::PromptsGet => match parse_params::<PromptGetParams>(request.params) {
                Ok(params) => {
                    let arguments = object_or_empty(params.arguments);
                    match self.router.get_prompt(&params.name, arguments, scope).await {
                        Ok(result) => to_value(result),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            },
            McpMethod::Unknown => {
                tracing::warn!(method = %request.method, "Unknown MCP method");
                if self.kind == SessionKind::Bridge {
                    return None;
                }
                Err(JsonRpcError::method_not_found(&request.method))
            }
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn object_or_empty(arguments: Value) -> Value {
    if arguments.is_null() {
        json!({})
    } else {
        arguments
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mcp::adapter::DefaultAdapterFactory;
    use crate::mcp::manager::{BackendManager, ManagerSettings};
    use crate::mcp::search::InMemoryToolSearch;
    use mcphub_shared::MemoryConfigStore;
    use std::time::Duration;

    fn handler(kind: SessionKind) -> McpRequestHandler {
        let store = Arc::new(MemoryConfigStore::new(Default::default()));
        let factory =
            DefaultAdapterFactory::new(Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        let manager = BackendManager::new(
            store,
            Arc::new(factory),
            Arc::new(InMemoryToolSearch::new()),
            ManagerSettings::default(),
        );
        McpRequestHandler::new(Arc::new(McpRouter::new(manager)), kind)
    }

    #[test]
    fn test_method_classification() {
        assert_eq!(McpMethod::from_name("tools/call"), McpMethod::ToolsCall);
        assert_eq!(McpMethod::from_name("resources/list"), McpMethod::Unknown);
        assert!(McpMethod::ToolsList.is_tool_method());
        assert!(!McpMethod::PromptsGet.is_tool_method());
    }

    #[tokio::test]
    async fn test_bridge_initialize_advertises_tools_only() {
        let handler = handler(SessionKind::Bridge);
        let response = handler
            .handle(JsonRpcRequest::new(1, "initialize", Some(json!({}))), &Scope::All)
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["capabilities"], json!({"tools": {}}));
        assert_eq!(result["serverInfo"]["name"], BRIDGE_SERVER_NAME);
    }

    #[tokio::test]
    async fn test_unknown_methods_per_session_kind() {
        let request = JsonRpcRequest::new(7, "resources/list", None);

        let bridge = handler(SessionKind::Bridge);
        assert!(bridge.handle(request.clone(), &Scope::All).await.is_none());

        let local = handler(SessionKind::Local);
        let response = local.handle(request, &Scope::All).await.unwrap();
        assert_eq!(response.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ping_and_notifications() {
        let handler = handler(SessionKind::Local);
        let pong = handler
            .handle(JsonRpcRequest::new(2, "ping", None), &Scope::All)
            .await
            .unwrap();
        assert_eq!(pong.result, Some(json!({})));

        let note = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(handler.handle(note, &Scope::All).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error_result() {
        let handler = handler(SessionKind::Local);
        let request = JsonRpcRequest::new(
            3,
            "tools/call",
            Some(json!({"name": "nowhere-tool", "arguments": {}})),
        );
        let response = handler.handle(request, &Scope::All).await.unwrap();

        let result: ToolCallResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(result.is_error);
        assert!(result.text_payload().starts_with("Error: "));
    }
}
