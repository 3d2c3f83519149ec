use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::info;

use crate::{auth::admin::require_admin, error::AppError, state::AppState};

/// `GET /api/cache/stats`: counters and occupancy of the tier cache.
#[tracing::instrument(skip(state, headers))]
pub async fn stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(state.config.admin_token.as_deref(), &headers)?;
    Ok(Json(state.cache().get_stats()))
}

/// `POST /api/cache/invalidate/{user_id}`: drop every cached tier for a
/// user. Idempotent; a resolution already in flight will not write back.
#[tracing::instrument(skip(state, headers))]
pub async fn invalidate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(state.config.admin_token.as_deref(), &headers)?;
    let removed = state.cache().invalidate(&user_id);
    info!(user_id = %user_id, removed, "Cache invalidated by operator");
    Ok(Json(json!({ "removed": removed })))
}
