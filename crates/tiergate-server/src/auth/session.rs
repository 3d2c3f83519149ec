use anyhow::{anyhow, Result};
use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Cookie the host application sets for browser sessions.
pub const SESSION_COOKIE: &str = "__session";

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Sign an HS256 session token for `user_id`.
pub fn encode_session(secret: &str, user_id: &str, ttl: Duration) -> Result<String> {
    let now = Utc::now();
    let claims = SessionClaims {
        sub: user_id.to_string(),
        exp: (now + ttl).timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| anyhow!("encode_session: {}", e))
}

/// Decode and validate a session token (signature and expiry).
pub fn decode_session(token: &str, secret: &str) -> Result<SessionClaims> {
    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| anyhow!("decode_session: {}", e))?;
    Ok(data.claims)
}

/// Raw token from `Authorization: Bearer` or the session cookie. The header
/// wins when both are present.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    if bearer.is_some() {
        return bearer;
    }
    headers
        .get(header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_str| {
            cookie_str
                .split(';')
                .find_map(|c| {
                    c.trim()
                        .strip_prefix(SESSION_COOKIE)
                        .and_then(|rest| rest.strip_prefix('='))
                })
                .map(|t| t.to_string())
        })
}

/// The authenticated user id, or `None` when there is no valid session.
/// Without a configured secret every caller is anonymous.
pub fn session_user(secret: Option<&str>, headers: &HeaderMap) -> Option<String> {
    let secret = secret?;
    let token = session_token(headers)?;
    match decode_session(&token, secret) {
        Ok(claims) if !claims.sub.is_empty() => Some(claims.sub),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected session token");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const SECRET: &str = "test-session-secret";

    #[test]
    fn bearer_token_round_trips() {
        let token = encode_session(SECRET, "user_1", Duration::hours(1)).expect("encode");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
        );
        assert_eq!(session_user(Some(SECRET), &headers).as_deref(), Some("user_1"));
    }

    #[test]
    fn cookie_token_is_accepted() {
        let token = encode_session(SECRET, "user_2", Duration::hours(1)).expect("encode");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE}={token}"))
                .expect("header"),
        );
        assert_eq!(session_user(Some(SECRET), &headers).as_deref(), Some("user_2"));
    }

    #[test]
    fn expired_or_foreign_tokens_are_anonymous() {
        let expired = encode_session(SECRET, "user_1", Duration::hours(-2)).expect("encode");
        let foreign = encode_session("other", "user_1", Duration::hours(1)).expect("encode");
        for token in [expired, foreign] {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
            );
            assert_eq!(session_user(Some(SECRET), &headers), None);
        }
    }

    #[test]
    fn no_secret_means_no_session() {
        let token = encode_session(SECRET, "user_1", Duration::hours(1)).expect("encode");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
        );
        assert_eq!(session_user(None, &headers), None);
    }
}
