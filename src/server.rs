use std::future::Future;
use std::time::Duration;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        get_seller_balance, get_seller_ledger, get_seller_orders, get_seller_payouts,
        health_check, paymongo_webhook, reconcile, run_payouts, settle_payment, stale_payouts,
        AppState,
    },
    error::{AppError, AppResult},
    middleware::{create_cors_layer, rate_limit_middleware, require_bearer, validate_json},
    settlement::PaymentConfirmedEvent,
};

pub fn create_app(state: AppState) -> Router {
    info!("Setting up HTTP routes...");

    // Payment intake: rate limited, bounded in time
    let intake = Router::new()
        .route(
            "/settlements",
            post(settle_payment).route_layer(from_fn(validate_json::<PaymentConfirmedEvent>)),
        )
        .route("/webhooks/paymongo", post(paymongo_webhook))
        .route_layer(from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    // Operator read views
    let sellers = Router::new()
        .route("/sellers/:seller_id/balance", get(get_seller_balance))
        .route("/sellers/:seller_id/ledger", get(get_seller_ledger))
        .route("/sellers/:seller_id/orders", get(get_seller_orders))
        .route("/sellers/:seller_id/payouts", get(get_seller_payouts));

    // Shared-secret routes; a payout run may outlast any request timeout
    let protected = Router::new()
        .route("/payouts/run", post(run_payouts))
        .route("/admin/reconcile/:seller_id", get(reconcile))
        .route("/admin/payouts/stale", get(stale_payouts))
        .route_layer(from_fn_with_state(state.clone(), require_bearer));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", intake.merge(sellers).merge(protected))
        .layer(CompressionLayer::new())
        .layer(create_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Config(format!("Cannot bind {}: {}", bind_address, e)))?;
    info!("Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AppError::Internal(format!("Server error: {}", e)))?;
    Ok(())
}
