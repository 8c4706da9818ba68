//! HTTP routes

pub mod admin;
pub mod health;
pub mod mcp;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    state::AppState,
    websocket::{ws_group_handler, ws_handler},
};

/// Request body limit for JSON-RPC posts
const MCP_MAX_REQUEST_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Create all routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    let mcp_routes = Router::new()
        .route("/mcp", post(mcp::handle_mcp_request))
        .route("/mcp/:group", post(mcp::handle_scoped_mcp_request))
        .layer(DefaultBodyLimit::max(MCP_MAX_REQUEST_BODY_BYTES));

    let websocket_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/:group", get(ws_group_handler));

    let admin_routes = Router::new()
        .route("/admin/reload", post(admin::reload))
        .route("/admin/endpoints/:id/reconnect", post(admin::reconnect_endpoint));

    Router::new()
        .merge(health_routes)
        .merge(mcp_routes)
        .merge(websocket_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
