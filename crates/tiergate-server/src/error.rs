use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tiergate_core::ReasonCode;
use tiergate_engine::SyncError;

/// Application-level errors that map directly to HTTP responses.
///
/// Every variant implements [`IntoResponse`] so Axum handlers can use
/// `Result<impl IntoResponse, AppError>` as their return type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    /// A tier gate refused the request.
    #[error("access denied: {}", .0.message())]
    AccessDenied(ReasonCode),

    #[error("not configured: {0}")]
    NotConfigured(&'static str),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Unauthorized".to_string(),
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden", "Forbidden".to_string()),
            AppError::AccessDenied(reason) => (
                StatusCode::FORBIDDEN,
                reason_code(*reason),
                reason.message().to_string(),
            ),
            AppError::NotConfigured(what) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "not_configured",
                format!("{what} is not configured"),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": message,
                    "field": null
                }
            })),
        )
            .into_response()
    }
}

fn reason_code(reason: ReasonCode) -> &'static str {
    match reason {
        ReasonCode::InsufficientTier => "insufficient_tier",
        ReasonCode::MissingFeature => "missing_feature",
        ReasonCode::AuthenticationRequired => "authentication_required",
        _ => "forbidden",
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        match e {
            // 404 makes the provider retry; the customer may be linked later.
            SyncError::UnknownUser { customer_id } => {
                AppError::NotFound(format!("no user linked to customer {customer_id}"))
            }
            SyncError::Store(e) => AppError::Internal(e),
        }
    }
}
