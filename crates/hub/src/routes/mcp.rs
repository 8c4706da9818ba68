//! Stateless JSON-RPC endpoint
//!
//! `POST /mcp` serves the whole catalog, `POST /mcp/:group` a group, a single
//! backend, or smart routing (`$smart`, `$smart/{group}`).

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::ApiError;
use crate::mcp::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::state::AppState;

pub async fn handle_mcp_request(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch(&state, None, &body).await
}

pub async fn handle_scoped_mcp_request(
    State(state): State<AppState>,
    Path(group): Path<String>,
    body: Bytes,
) -> Response {
    dispatch(&state, Some(&group), &body).await
}

async fn dispatch(state: &AppState, key: Option<&str>, body: &[u8]) -> Response {
    let Some(scope) = state.router.resolve_scope(key) else {
        return ApiError::UnknownScope(key.unwrap_or_default().to_string()).into_response();
    };

    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed JSON-RPC request");
            let response = JsonRpcResponse::error(None, JsonRpcError::parse_error(e.to_string()));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    tracing::debug!(method = %request.method, scope = ?key, "MCP request");
    match state.handler.handle(request, &scope).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}
