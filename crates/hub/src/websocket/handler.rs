//! WebSocket handler for Axum
//!
//! Local MCP sessions: JSON-RPC requests in, responses and
//! `notifications/tools/list_changed` out.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ApiError, ApiResult};
use crate::mcp::{JsonRpcError, JsonRpcMessage, JsonRpcResponse};
use crate::state::AppState;

use super::connection::Connection;

/// `GET /ws`: unscoped session
pub async fn ws_handler(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, None, app_state))
}

/// `GET /ws/{group}`: session scoped by group, backend or `$smart`
pub async fn ws_group_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Path(group): Path<String>,
) -> ApiResult<Response> {
    if app_state.router.resolve_scope(Some(&group)).is_none() {
        tracing::warn!(group = %group, "WebSocket session for unknown scope rejected");
        return Err(ApiError::UnknownScope(group));
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, Some(group), app_state)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, scope_key: Option<String>, app_state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Frames for this session, from responses and tools-changed fan-out alike
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let sessions = app_state.sessions.clone();
    let conn = sessions.add_connection(Connection::new(scope_key, tx)).await;
    let session_id = conn.session_id;

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break; // Connection closed
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let Ok(msg) = msg else {
            break;
        };
        match msg {
            Message::Text(text) => {
                handle_frame(text, Arc::clone(&conn), app_state.clone());
            }
            Message::Close(_) => {
                tracing::info!(session_id = %session_id, "WebSocket close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Axum handles ping/pong automatically
            }
            _ => {} // Ignore binary messages
        }
    }

    sessions.remove_connection(&session_id).await;
    send_task.abort();
}

/// Answer one frame on its own task so slow tool calls do not block the session
fn handle_frame(text: String, conn: Arc<Connection>, app_state: AppState) {
    let request = match serde_json::from_str::<JsonRpcMessage>(&text) {
        Ok(JsonRpcMessage::Request(request)) => request,
        Ok(JsonRpcMessage::Response(_)) => return,
        Err(e) => {
            tracing::warn!(session_id = %conn.session_id, error = %e, "Failed to parse JSON-RPC frame");
            let response = JsonRpcResponse::error(None, JsonRpcError::parse_error(e.to_string()));
            if let Ok(frame) = serde_json::to_string(&response) {
                conn.send(frame);
            }
            return;
        }
    };

    tokio::spawn(async move {
        let scope = match app_state.router.resolve_scope(conn.scope_key.as_deref()) {
            Some(scope) => scope,
            None => {
                let message = format!("Unknown group or server: {}", conn.scope_key.as_deref().unwrap_or_default());
                if !request.is_notification() {
                    let response = JsonRpcResponse::error(request.id, JsonRpcError::invalid_params(message));
                    if let Ok(frame) = serde_json::to_string(&response) {
                        conn.send(frame);
                    }
                }
                return;
            }
        };

        if let Some(response) = app_state.handler.handle(request, &scope).await {
            match serde_json::to_string(&response) {
                Ok(frame) => {
                    conn.send(frame);
                }
                Err(e) => tracing::error!(error = ?e, "Failed to serialize JSON-RPC response"),
            }
        }
    });
}
