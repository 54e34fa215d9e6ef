//! Bearer token authentication for the admin routes and publisher posts.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::ApiError;
use super::AppState;

const ADMIN_TOKEN_KEY: &[u8] = b"feedsync-admin-token";

/// Middleware that requires `Authorization: Bearer <token>` matching
/// `FEEDSYNC_ADMIN_TOKEN`.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::Unauthorized);
    };

    authorize(expected, request.headers())?;
    Ok(next.run(request).await)
}

/// Check `Authorization: Bearer <token>` against `expected`.
pub fn authorize(expected: &str, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = match headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
    {
        Some(token) => token,
        None => {
            tracing::debug!("missing or malformed authorization header");
            return Err(ApiError::Unauthorized);
        }
    };

    if !tokens_match(expected, token) {
        tracing::debug!("invalid admin token");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// Constant-time token comparison.
fn tokens_match(expected: &str, presented: &str) -> bool {
    let mac = |token: &str| {
        Hmac::<Sha256>::new_from_slice(ADMIN_TOKEN_KEY).map(|mut mac| {
            mac.update(token.as_bytes());
            mac
        })
    };
    match (mac(expected), mac(presented)) {
        (Ok(expected), Ok(presented)) => presented
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}
