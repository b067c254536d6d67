use axum::{
    body::Body,
    extract::Request,
    middleware::Next,
    response::Response,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::error::{AppError, SettlementError};

/// Largest request body accepted by the validated routes
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Deserialize and validate a JSON body before the handler sees it; the
/// request is rebuilt with the same bytes afterwards.
pub async fn validate_json<T: DeserializeOwned + Validate>(
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::BadRequest("Request body too large or unreadable".to_string()))?;

    let value: T = serde_json::from_slice(&bytes)
        .map_err(|e| SettlementError::Validation(format!("Invalid JSON: {}", e)))?;

    value.validate().map_err(|e| {
        let errors = e
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| e.message.as_ref().map(|s| s.to_string()).unwrap_or_default())
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        SettlementError::Validation(format!("Validation failed: {}", errors))
    })?;

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}
