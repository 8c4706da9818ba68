//! Per-request routing mode for endpoint consumers

use mcphub_shared::{Endpoint, Group};

use crate::mcp::router::{McpRouter, Scope, SMART_KEY};
use crate::mcp::McpMethod;

/// Routing key for one request on `endpoint`.
///
/// Smart routing applies only to tool methods, and only when it is switched on
/// globally and the endpoint opted in. Otherwise the endpoint's group, if any.
pub fn routing_key(endpoint: &Endpoint, smart_enabled: bool, method: McpMethod) -> Option<String> {
    let group = endpoint
        .group_id
        .as_deref()
        .map(str::trim)
        .filter(|g| !g.is_empty());

    if smart_enabled && endpoint.use_smart_routing && method.is_tool_method() {
        return Some(match group {
            Some(group) => format!("{}/{}", SMART_KEY, group),
            None => SMART_KEY.to_string(),
        });
    }
    group.map(str::to_string)
}

/// Resolve the scope for one request. A group that no longer exists exposes nothing.
pub fn scope_for(
    router: &McpRouter,
    endpoint: &Endpoint,
    smart_enabled: bool,
    method: McpMethod,
) -> Scope {
    let key = routing_key(endpoint, smart_enabled, method);
    if let Some(scope) = router.resolve_scope(key.as_deref()) {
        return scope;
    }

    tracing::warn!(
        endpoint_id = %endpoint.id,
        key = ?key,
        "Endpoint group not found, exposing no tools"
    );
    match key {
        Some(key) if key.starts_with(SMART_KEY) => Scope::Smart {
            servers: Some(Vec::new()),
        },
        _ => Scope::Group(Group {
            id: String::new(),
            name: String::new(),
            description: None,
            servers: Vec::new(),
            owner: None,
        }),
    }
}
