use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("A payout run is already in progress")]
    RunInProgress,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited,
}

/// Balance and ledger storage errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Balance invariant violated for seller {seller_id}: {field} is {current}, delta {delta}")]
    InvariantViolation {
        seller_id: String,
        field: &'static str,
        current: i64,
        delta: i64,
    },

    #[error("Order already exists for payment {payment_reference} and seller {seller_id}")]
    DuplicateOrder {
        payment_reference: String,
        seller_id: String,
    },

    #[error("Order amounts for seller {seller_id} overflow a balance")]
    AmountOverflow { seller_id: String },

    #[error("Payout {0} not found")]
    PayoutNotFound(Uuid),

    #[error("Payout {payout_id} is {current}, expected processing")]
    PayoutNotProcessing { payout_id: Uuid, current: String },

    #[error("Order status changed under payout {payout_id}: expected {expected} ready orders, found {actual}")]
    OrderStateConflict {
        payout_id: Uuid,
        expected: usize,
        actual: usize,
    },
}

/// Settlement intake errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Invalid settlement event: {0}")]
    Validation(String),

    #[error("Invalid line item {product_id}: {reason}")]
    InvalidLine { product_id: String, reason: String },

    #[error("Malformed webhook payload: {0}")]
    MalformedWebhook(String),
}

/// Disbursement provider errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Rejected(String),
}

impl GatewayError {
    /// Reason recorded on the failed payout row
    pub fn failure_reason(&self) -> String {
        match self {
            GatewayError::Timeout => "timeout".to_string(),
            GatewayError::Transport(msg) => format!("transport: {}", msg),
            GatewayError::Rejected(detail) => detail.clone(),
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Settlement(SettlementError::Validation(msg)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_EVENT",
                msg,
                None,
            ),
            AppError::Settlement(SettlementError::InvalidLine { product_id, reason }) => (
                StatusCode::BAD_REQUEST,
                "INVALID_LINE_ITEM",
                format!("Invalid line item {}: {}", product_id, reason),
                Some(serde_json::json!({ "product_id": product_id })),
            ),
            AppError::Settlement(SettlementError::MalformedWebhook(msg)) => (
                StatusCode::BAD_REQUEST,
                "MALFORMED_WEBHOOK",
                msg,
                None,
            ),
            AppError::Ledger(LedgerError::InvariantViolation {
                seller_id,
                field,
                current,
                delta,
            }) => (
                StatusCode::CONFLICT,
                "INVARIANT_VIOLATION",
                format!("Balance invariant violated for seller {}", seller_id),
                Some(serde_json::json!({
                    "seller_id": seller_id,
                    "field": field,
                    "current": current,
                    "delta": delta,
                })),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Unauthorized".to_string(),
                None,
            ),
            AppError::RunInProgress => (
                StatusCode::CONFLICT,
                "RUN_IN_PROGRESS",
                "A payout run is already in progress".to_string(),
                None,
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Rate limit exceeded. Please try again later.".to_string(),
                None,
            ),
            AppError::Database(_) | AppError::Ledger(LedgerError::Storage(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
