use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Guard for the operator endpoints. When an admin token is configured the
/// caller must present it as a bearer token; without one the endpoints are
/// open and expected to sit on a private network.
pub fn require_admin(admin_token: Option<&str>, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = admin_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;
    // Compare digests so the comparison time does not depend on a shared prefix.
    if Sha256::digest(presented.trim().as_bytes()) == Sha256::digest(expected.as_bytes()) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}
