use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::models::*;
use crate::{
    config::PayoutConfig,
    error::{AppError, AppResult},
    ledger::{
        models::SellerBalance,
        reconcile::{reconcile_seller, ReconciliationReport},
        store::LedgerStore,
    },
    middleware::RateLimitLayer,
    payout::{PayoutRunReport, PayoutScheduler},
    settlement::{PaymentConfirmedEvent, SettlementProcessor, SettlementReport, WebhookEnvelope},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PayoutConfig>,
    pub store: Arc<dyn LedgerStore>,
    pub processor: Arc<SettlementProcessor>,
    pub scheduler: Arc<PayoutScheduler>,
    pub rate_limiter: RateLimitLayer,
}

/// 503 on a partial settlement so the provider redelivers; the settled
/// sellers are skipped on redelivery.
fn settlement_status(report: &SettlementReport) -> StatusCode {
    if report.is_complete() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state.store.get_balance("health-probe").await {
        Ok(_) => "healthy",
        Err(e) => {
            warn!(error = %e, "Health probe could not reach storage");
            "degraded"
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        storage: format!("{:?}", state.config.storage).to_lowercase(),
        timestamp: Utc::now(),
    })
}

/// POST /api/v1/settlements
pub async fn settle_payment(
    State(state): State<AppState>,
    Json(event): Json<PaymentConfirmedEvent>,
) -> AppResult<(StatusCode, Json<SettlementReport>)> {
    info!(
        payment_reference = %event.payment_reference,
        lines = event.line_items.len(),
        "Received payment confirmation"
    );

    let report = state.processor.process(event).await?;
    Ok((settlement_status(&report), Json(report)))
}

/// POST /api/v1/webhooks/paymongo
///
/// Only paid checkout sessions are settled; every other event type is
/// acknowledged so the provider stops redelivering it.
pub async fn paymongo_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<WebhookEnvelope>,
) -> AppResult<(StatusCode, Json<WebhookAck>)> {
    let event_type = envelope.event_type().to_string();

    let Some(event) = envelope.into_event()? else {
        info!(event_type = %event_type, "Ignoring webhook event");
        return Ok((
            StatusCode::OK,
            Json(WebhookAck {
                received: true,
                event_type,
                settlement: None,
            }),
        ));
    };

    info!(
        event_type = %event_type,
        payment_reference = %event.payment_reference,
        "Received paid checkout webhook"
    );

    let report = state.processor.process(event).await?;
    Ok((
        settlement_status(&report),
        Json(WebhookAck {
            received: true,
            event_type,
            settlement: Some(report),
        }),
    ))
}

/// POST /api/v1/payouts/run (bearer token)
pub async fn run_payouts(State(state): State<AppState>) -> AppResult<Json<PayoutRunReport>> {
    info!("Payout run triggered over HTTP");
    let report = state.scheduler.run_detached(Utc::now()).await?;
    Ok(Json(report))
}

/// GET /api/v1/sellers/:seller_id/balance
pub async fn get_seller_balance(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
) -> AppResult<Json<SellerBalance>> {
    let balance = state
        .store
        .get_balance(&seller_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("balance for seller {}", seller_id)))?;
    Ok(Json(balance))
}

/// GET /api/v1/sellers/:seller_id/ledger
pub async fn get_seller_ledger(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<LedgerResponse>> {
    let entries = state.store.entries_for_seller(&seller_id).await?;
    Ok(Json(LedgerResponse {
        seller_id,
        entries: query.tail(entries),
    }))
}

/// GET /api/v1/sellers/:seller_id/orders
pub async fn get_seller_orders(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<OrdersResponse>> {
    let orders = state.store.orders_for_seller(&seller_id).await?;
    Ok(Json(OrdersResponse {
        seller_id,
        orders: query.tail(orders),
    }))
}

/// GET /api/v1/sellers/:seller_id/payouts
pub async fn get_seller_payouts(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
) -> AppResult<Json<PayoutsResponse>> {
    let mut payouts = Vec::new();
    for payout in state.store.payouts_for_seller(&seller_id).await? {
        let items = state.store.payout_items(payout.id).await?;
        payouts.push(PayoutWithItems { payout, items });
    }

    Ok(Json(PayoutsResponse { seller_id, payouts }))
}

/// GET /api/v1/admin/reconcile/:seller_id (bearer token)
pub async fn reconcile(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
) -> AppResult<Json<ReconciliationReport>> {
    let report = reconcile_seller(state.store.as_ref(), &seller_id).await?;
    Ok(Json(report))
}

/// GET /api/v1/admin/payouts/stale (bearer token)
pub async fn stale_payouts(State(state): State<AppState>) -> AppResult<Json<StalePayoutsResponse>> {
    let payouts = state.scheduler.stale_payouts(Utc::now()).await?;
    Ok(Json(StalePayoutsResponse {
        older_than_minutes: state.config.stale_payout_after_minutes,
        payouts,
    }))
}
