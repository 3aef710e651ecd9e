//! Bearer token authentication for storage nodes
//!
//! Storage nodes present the shared secret as `Authorization: Bearer <secret>`.
//! Anything else gets a bare 403. A coordinator without a configured secret
//! refuses every queue call.

use crate::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Authentication error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable authorization header
    MissingToken,
    /// Token does not match the shared secret
    InvalidToken,
    /// No shared secret is configured
    NotConfigured,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::FORBIDDEN,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Forbidden",
        )
            .into_response()
    }
}

/// Authentication middleware layer
pub async fn auth_layer(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(secret) = state.storage_node_secret.as_deref() else {
        warn!(
            "Refused {} {}: no storage node secret configured",
            request.method(),
            request.uri().path()
        );
        return Err(AuthError::NotConfigured);
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer)
        .ok_or(AuthError::MissingToken)?;

    if !tokens_match(token.as_bytes(), secret.as_bytes()) {
        warn!("Refused {}: invalid storage node token", request.uri().path());
        return Err(AuthError::InvalidToken);
    }

    debug!("Authenticated storage node request {}", request.uri().path());
    Ok(next.run(request).await)
}

/// Token of a `Bearer` authorization header
fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Comparison that does not stop at the first differing byte
fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
