use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tiergate_core::{ReasonCode, RoutingDecision};

use crate::{auth::session::session_user, error::AppError, state::AppState};

/// Inserted into request extensions once [`tier_gate`] lets a signed-in
/// caller through.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub user_id: String,
    pub decision: RoutingDecision,
}

/// Tier gate for routes of a host application.
///
/// Mount with `axum::middleware::from_fn_with_state(state, tier_gate)`.
/// Browser routes that are denied are redirected (307) to the decision's
/// target; API routes get a JSON 401/403.
pub async fn tier_gate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(user_id) = session_user(state.config.session_secret.as_deref(), request.headers())
    else {
        let decision = state.gate.decide_unauthenticated(&path);
        if decision.allow_access {
            return next.run(request).await;
        }
        return denied(decision);
    };

    let decision = state.gate.decide_access(&path, &user_id).await;
    if !decision.allow_access {
        tracing::debug!(
            user_id = %user_id,
            path = %path,
            reason = ?decision.reason,
            "Tier gate denied request"
        );
        return denied(decision);
    }
    request
        .extensions_mut()
        .insert(GateContext { user_id, decision });
    next.run(request).await
}

fn denied(decision: RoutingDecision) -> Response {
    match decision.target_route.as_deref() {
        Some(target) if decision.should_redirect => Redirect::temporary(target).into_response(),
        _ if decision.reason == ReasonCode::AuthenticationRequired => {
            AppError::Unauthorized.into_response()
        }
        _ => AppError::AccessDenied(decision.reason).into_response(),
    }
}
