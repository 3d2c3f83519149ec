use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tiergate_core::{ReasonCode, RoutingDecision};

use crate::{
    auth::{admin::require_admin, session::session_user},
    error::AppError,
    state::AppState,
};

/// Response header carrying the caller's resolved tier.
pub const TIER_HEADER: HeaderName = HeaderName::from_static("x-tiergate-tier");

/// Header reverse proxies use to pass the original request URI.
const FORWARDED_URI: &str = "x-forwarded-uri";

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub path: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// `POST /api/access/decide`: decision for an explicit user, for services
/// that have already authenticated the caller. A missing or empty `user_id`
/// is treated as an anonymous caller.
#[tracing::instrument(skip_all, fields(path = %req.path))]
pub async fn decide(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DecideRequest>,
) -> Result<Json<RoutingDecision>, AppError> {
    require_admin(state.config.admin_token.as_deref(), &headers)?;
    let decision = match req.user_id.as_deref().filter(|u| !u.is_empty()) {
        Some(user_id) => state.gate.decide_access(&req.path, user_id).await,
        None => state.gate.decide_unauthenticated(&req.path),
    };
    Ok(Json(decision))
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub path: Option<String>,
}

/// `GET /api/access/check?path=...`: forward-auth endpoint for a reverse
/// proxy. The caller is identified by its session token; the path comes from
/// the query string or `X-Forwarded-Uri`.
///
/// 200 allows, 307 redirects to the decision's target, 401 asks for a login
/// and 403 denies. The body is always the decision.
#[tracing::instrument(skip_all)]
pub async fn check(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CheckQuery>,
) -> Result<Response, AppError> {
    let path = query
        .path
        .or_else(|| {
            headers
                .get(FORWARDED_URI)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| AppError::BadRequest("path is required".to_string()))?;

    let decision = match session_user(state.config.session_secret.as_deref(), &headers) {
        Some(user_id) => state.gate.decide_access(&path, &user_id).await,
        None => state.gate.decide_unauthenticated(&path),
    };
    Ok(decision_response(decision))
}

/// HTTP rendition of a decision.
pub fn decision_response(decision: RoutingDecision) -> Response {
    let status = if decision.allow_access {
        StatusCode::OK
    } else if decision.should_redirect {
        StatusCode::TEMPORARY_REDIRECT
    } else if decision.reason == ReasonCode::AuthenticationRequired {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::FORBIDDEN
    };

    let tier = decision.current_tier;
    let location = decision
        .target_route
        .clone()
        .filter(|_| status == StatusCode::TEMPORARY_REDIRECT);
    let mut response = (status, Json(decision)).into_response();

    if let Some(tier) = tier {
        if let Ok(value) = tier.as_str().parse() {
            response.headers_mut().insert(TIER_HEADER, value);
        }
    }
    if let Some(location) = location {
        if let Ok(value) = location.parse() {
            response.headers_mut().insert(header::LOCATION, value);
        }
    }
    response
}
