//! MCP Request Router
//!
//! Resolves what a caller may see (its [`Scope`]) and routes `tools/call` and
//! `prompts/get` to the backend that owns the name.
//!
//! # Namespacing
//!
//! Tools and prompts are exposed as `{backend}-{local}` (e.g. `fetch-fetch_url`).
//! The prefix is stripped before the call reaches the backend.
//!
//! # Filtering
//!
//! For every listing: backends that are disabled or not connected are skipped,
//! per-item overrides hide disabled items and replace descriptions, and a
//! group scope keeps only the tools its selection names.

use std::sync::Arc;

use mcphub_shared::{BackendConfig, ConfigStore, Group};
use serde_json::{json, Value};

use super::catalog::{local_name, BackendRuntime};
use super::manager::BackendManager;
use super::smart::{self, HitStatus};
use super::types::*;

/// Routing key that selects smart routing
pub const SMART_KEY: &str = "$smart";

/// What a caller is allowed to see
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// Every enabled, connected backend
    All,
    Group(Group),
    /// A routing key naming a backend rather than a group
    Backend(String),
    /// `search_tools` + `call_tool`, optionally narrowed to some backends
    Smart { servers: Option<Vec<String>> },
}

impl Scope {
    fn includes(&self, backend: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Group(group) => group.server(backend).is_some(),
            Scope::Backend(name) => name == backend,
            Scope::Smart { servers } => servers
                .as_ref()
                .map_or(true, |names| names.iter().any(|n| n == backend)),
        }
    }

    fn allows_tool(&self, backend: &str, local: &str) -> bool {
        match self {
            Scope::Group(group) => group
                .server(backend)
                .is_some_and(|server| server.tools.allows(local)),
            _ => self.includes(backend),
        }
    }
}

/// MCP Request Router
pub struct McpRouter {
    manager: Arc<BackendManager>,
}

impl McpRouter {
    pub fn new(manager: Arc<BackendManager>) -> Self {
        Self { manager }
    }

    fn store(&self) -> &Arc<dyn ConfigStore> {
        self.manager.store()
    }

    /// Resolve a routing key (`/mcp/{key}`, endpoint group, ...) into a scope.
    ///
    /// `$smart` and `$smart/{group}` select smart routing. Other keys match a
    /// group by id, or by name when group-name routing is enabled, and then a
    /// backend by name. Unknown keys resolve to `None`.
    pub fn resolve_scope(&self, key: Option<&str>) -> Option<Scope> {
        let key = match key.map(str::trim) {
            None | Some("") => return Some(Scope::All),
            Some(key) => key,
        };

        if key == SMART_KEY {
            return Some(Scope::Smart { servers: None });
        }
        if let Some(group_key) = key.strip_prefix(SMART_KEY).and_then(|k| k.strip_prefix('/')) {
            let group = self.find_group(group_key)?;
            return Some(Scope::Smart {
                servers: Some(group.server_names()),
            });
        }

        if let Some(group) = self.find_group(key) {
            return Some(Scope::Group(group));
        }
        if self.store().backend_exists(key) {
            return Some(Scope::Backend(key.to_string()));
        }
        None
    }

    fn find_group(&self, key: &str) -> Option<Group> {
        let by_name = self
            .store()
            .system_settings()
            .routing
            .enable_group_name_route;
        self.store()
            .get_group(key)
            .filter(|group| by_name || group.id == key)
    }

    /// Serving runtimes in scope, paired with their current configuration
    fn serving(&self, scope: &Scope) -> Vec<(Arc<BackendRuntime>, Option<BackendConfig>)> {
        self.manager
            .catalog()
            .snapshot()
            .into_iter()
            .filter(|rt| rt.is_serving() && scope.includes(&rt.name))
            .map(|rt| {
                let config = self.store().get_backend(&rt.name);
                (rt, config)
            })
            .collect()
    }

    /// The tool as a caller in `scope` would see it, or None when hidden
    fn visible_tool(
        scope: &Scope,
        runtime: &BackendRuntime,
        config: Option<&BackendConfig>,
        tool: &Tool,
    ) -> Option<Tool> {
        let local = local_name(&runtime.name, &tool.name);
        let override_ = config.and_then(|c| c.tool_override(&tool.name, local));
        if override_.is_some_and(|o| !o.enabled) {
            return None;
        }
        if !scope.allows_tool(&runtime.name, local) {
            return None;
        }

        let mut tool = tool.clone();
        if let Some(description) = override_.and_then(|o| o.description.clone()) {
            tool.description = Some(description);
        }
        Some(tool)
    }

    /// Names of backends currently serving (smart-routing tool description)
    fn available_servers(&self, scope: &Scope) -> Vec<String> {
        self.serving(scope)
            .into_iter()
            .map(|(rt, _)| rt.name.clone())
            .collect()
    }

    pub fn list_tools(&self, scope: &Scope) -> Vec<Tool> {
        if let Scope::Smart { .. } = scope {
            return smart::smart_tools(&self.available_servers(scope));
        }

        self.serving(scope)
            .iter()
            .flat_map(|(rt, config)| {
                rt.tools
                    .iter()
                    .filter_map(|tool| Self::visible_tool(scope, rt, config.as_ref(), tool))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn list_prompts(&self, scope: &Scope) -> Vec<Prompt> {
        if let Scope::Smart { .. } = scope {
            return Vec::new();
        }

        self.serving(scope)
            .iter()
            .flat_map(|(rt, config)| {
                rt.prompts
                    .iter()
                    .filter_map(|prompt| {
                        let local = local_name(&rt.name, &prompt.name);
                        let override_ = config
                            .as_ref()
                            .and_then(|c| c.prompt_override(&prompt.name, local));
                        if override_.is_some_and(|o| !o.enabled) {
                            return None;
                        }
                        let mut prompt = prompt.clone();
                        if let Some(description) = override_.and_then(|o| o.description.clone()) {
                            prompt.description = Some(description);
                        }
                        Some(prompt)
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Route a tool call. Failures are returned as error results, never raised.
    pub async fn call_tool(&self, name: &str, arguments: Value, scope: &Scope) -> ToolCallResult {
        if let Scope::Smart { servers } = scope {
            return match name {
                smart::SEARCH_TOOLS => self.search_tools(&arguments, servers.as_deref()).await,
                smart::CALL_TOOL => {
                    let Some(tool_name) = arguments.get("toolName").and_then(Value::as_str) else {
                        return ToolCallResult::error("toolName parameter is required");
                    };
                    let inner = arguments.get("arguments").cloned().unwrap_or_else(|| json!({}));
                    self.dispatch(tool_name, inner, scope).await
                }
                other => ToolCallResult::error(format!("Unknown tool: {}", other)),
            };
        }

        self.dispatch(name, arguments, scope).await
    }

    async fn dispatch(&self, name: &str, arguments: Value, scope: &Scope) -> ToolCallResult {
        let target = self.serving(scope).into_iter().find(|(rt, config)| {
            rt.tools
                .iter()
                .find(|tool| tool.name == name)
                .and_then(|tool| Self::visible_tool(scope, rt, config.as_ref(), tool))
                .is_some()
        });

        let Some((runtime, _)) = target else {
            tracing::warn!(tool = %name, "No available backend provides tool");
            return ToolCallResult::error(format!("No available servers found with tool: {}", name));
        };

        let local = local_name(&runtime.name, name);
        tracing::debug!(backend = %runtime.name, tool = %local, "Routing tool call");

        match self.manager.call_tool(&runtime.name, local, arguments).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(backend = %runtime.name, tool = %local, error = %e, "Tool call failed");
                ToolCallResult::error(e)
            }
        }
    }

    async fn search_tools(&self, arguments: &Value, servers: Option<&[String]>) -> ToolCallResult {
        let Some(query) = arguments
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
        else {
            return ToolCallResult::error("Query parameter is required and must be a string");
        };

        let limit = smart::clamp_limit(arguments.get("limit"));
        let threshold = smart::choose_threshold(query);
        tracing::debug!(query, limit, threshold, "Searching tools");

        let hits = self
            .manager
            .search()
            .search(query, limit, threshold, servers)
            .await;

        let unscoped = Scope::All;
        let response = smart::build_response(query, threshold, hits, |hit| {
            let Some(runtime) = self.manager.catalog().get(&hit.backend) else {
                return HitStatus::Unknown;
            };
            if !runtime.is_serving() {
                return HitStatus::Disabled;
            }
            let Some(tool) = runtime.tools.iter().find(|t| t.name == hit.tool_name) else {
                return HitStatus::Unknown;
            };
            let config = self.store().get_backend(&runtime.name);
            match Self::visible_tool(&unscoped, &runtime, config.as_ref(), tool) {
                Some(tool) => HitStatus::Visible(tool),
                None => HitStatus::Disabled,
            }
        });

        match serde_json::to_string(&response) {
            Ok(text) => ToolCallResult::text(text),
            Err(e) => ToolCallResult::error(e),
        }
    }

    /// Route a prompt fetch. Failures are JSON-RPC errors.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        scope: &Scope,
    ) -> Result<PromptGetResult, JsonRpcError> {
        let target = self
            .serving(scope)
            .into_iter()
            .find(|(rt, _)| rt.has_prompt(name));

        let Some((runtime, _)) = target else {
            return Err(JsonRpcError::invalid_params(format!("Prompt not found: {}", name)));
        };

        let local = local_name(&runtime.name, name);
        self.manager
            .get_prompt(&runtime.name, local, arguments)
            .await
            .map_err(|e| {
                tracing::warn!(backend = %runtime.name, prompt = %local, error = %e, "Prompt fetch failed");
                JsonRpcError::internal_error(e.to_string())
            })
    }
}
