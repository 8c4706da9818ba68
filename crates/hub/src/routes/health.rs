//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use mcphub_shared::ConnectionStatus;
use serde::Serialize;

use crate::bridge::EndpointStatus;
use crate::mcp::BackendSummary;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connected_backends: usize,
    pub local_sessions: usize,
    pub backends: Vec<BackendSummary>,
    pub endpoints: Vec<EndpointStatus>,
}

/// Backend and endpoint status summary.
///
/// Reports `degraded` (still 200) when an enabled backend is not connected;
/// the hub keeps serving whatever is up.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let backends = state.manager.summaries();
    let connected_backends = backends
        .iter()
        .filter(|b| b.enabled && b.status == ConnectionStatus::Connected)
        .count();
    let all_up = backends
        .iter()
        .filter(|b| b.enabled)
        .all(|b| b.status == ConnectionStatus::Connected);

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: if all_up { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connected_backends,
            local_sessions: state.sessions.connection_count().await,
            backends,
            endpoints: state.bridge.statuses(),
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
