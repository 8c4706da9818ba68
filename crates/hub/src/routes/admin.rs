//! Operator actions

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Serialize)]
pub struct ReloadResponse {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub reindexed: bool,
}

/// Re-read the settings file and apply it to backends and endpoints
pub async fn reload(State(state): State<AppState>) -> ApiResult<Json<ReloadResponse>> {
    let outcome = state.reload().await?;
    Ok(Json(ReloadResponse {
        added: outcome.added,
        removed: outcome.removed,
        reindexed: outcome.reindexed,
    }))
}

/// Manual endpoint reconnect with counters reset
pub async fn reconnect_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.bridge.reconnect(&id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::BadRequest(format!("Endpoint {} is not active", id)))
    }
}
