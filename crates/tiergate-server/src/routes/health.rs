use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// `GET /health`: liveness plus a cache summary.
///
/// The status code follows the tier store only. Decisions keep working
/// while the store is down because the resolver falls through to the
/// fallback tier, so a 503 here means "degraded", not "down".
///
/// ```json
/// { "status": "ok", "version": "0.1.0", "store": "ok",
///   "cache": { "entries": 12, "in_flight": 0, "hit_rate": 0.93 } }
/// ```
#[tracing::instrument(skip(state))]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.cache().get_stats();
    let cache = json!({
        "entries": stats.entry_count,
        "in_flight": stats.in_flight,
        "hit_rate": stats.hit_rate,
    });

    let (code, status, store) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok", "ok"),
        Err(e) => {
            tracing::warn!(error = %e, "Tier store ping failed; decisions run degraded");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", "unreachable")
        }
    };

    let body = json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "store": store,
        "cache": cache,
    });
    (code, Json(body)).into_response()
}
