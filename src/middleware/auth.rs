use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::api::handler::AppState;
use crate::error::AppError;

/// Constant-time comparison over SHA-256 digests
fn token_matches(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Shared-secret bearer check for the scheduler trigger and admin routes.
/// An unset token rejects every request.
pub async fn require_bearer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let authorized = bearer_token(&req)
        .map(|token| token_matches(token, &state.config.cron_token))
        .unwrap_or(false);

    if !authorized {
        warn!(path = %req.uri().path(), "Rejected request with missing or invalid bearer token");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(req).await)
}
