use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    config::{PayoutConfig, StorageBackend},
    error::AppResult,
    ledger::{BankDirectory, InMemoryLedgerStore, LedgerRepository, LedgerStore},
    middleware::RateLimitLayer,
    payout::{DisbursementGateway, PayMongoGateway, PayoutScheduler, ScriptedGateway},
    settlement::{FixedRateBreakdown, PriceBreakdown, SettlementProcessor, UpstreamBreakdown},
};

/// Everything the payout service needs, assembled from the configured backends
pub struct AppRuntime {
    pub state: AppState,
    /// Present when the in-process schedule loop is enabled
    pub scheduler_task: Option<JoinHandle<()>>,
}

pub async fn initialize_app_state(config: PayoutConfig) -> AppResult<AppRuntime> {
    info!("Initializing application components ...");

    let (store, banks, gateway): (
        Arc<dyn LedgerStore>,
        Arc<dyn BankDirectory>,
        Arc<dyn DisbursementGateway>,
    ) = match config.storage {
        StorageBackend::Postgres => {
            let pool = initialize_database(&config.database_url).await?;
            let repository = Arc::new(LedgerRepository::new(pool));

            if config.gateway_secret_key.is_empty() {
                warn!("PAYMONGO_SECRET_KEY not set - every disbursement will be rejected");
            }
            let gateway: Arc<dyn DisbursementGateway> = Arc::new(PayMongoGateway::new(
                &config.gateway_base_url,
                &config.gateway_secret_key,
                config.gateway_timeout(),
            )?);
            info!(base_url = %config.gateway_base_url, "PayMongo gateway initialized");

            let store: Arc<dyn LedgerStore> = repository.clone();
            let banks: Arc<dyn BankDirectory> = repository;
            (store, banks, gateway)
        }
        StorageBackend::Memory => {
            warn!("STORAGE=memory - ledger is not persisted and disbursements are simulated");
            let memory = Arc::new(InMemoryLedgerStore::new());
            let store: Arc<dyn LedgerStore> = memory.clone();
            let banks: Arc<dyn BankDirectory> = memory;
            let gateway: Arc<dyn DisbursementGateway> = Arc::new(ScriptedGateway::new());
            (store, banks, gateway)
        }
    };

    let state = build_app_state(config, store, banks, gateway);

    let scheduler_task = match state.config.schedule_interval_secs {
        0 => {
            info!("In-process payout schedule disabled; trigger runs over HTTP");
            None
        }
        secs => Some(state.scheduler.start(Duration::from_secs(secs))),
    };

    Ok(AppRuntime {
        state,
        scheduler_task,
    })
}

/// Wire the components around already-built backends
pub fn build_app_state(
    config: PayoutConfig,
    store: Arc<dyn LedgerStore>,
    banks: Arc<dyn BankDirectory>,
    gateway: Arc<dyn DisbursementGateway>,
) -> AppState {
    let pricing: Arc<dyn PriceBreakdown> = if config.recompute_prices {
        info!(
            fee_rate = %config.platform_fee_rate,
            conversion_rate = %config.conversion_rate,
            "Recomputing line prices at a fixed rate"
        );
        Arc::new(FixedRateBreakdown::new(
            config.platform_fee_rate,
            config.conversion_rate,
        ))
    } else {
        Arc::new(UpstreamBreakdown)
    };

    let processor = Arc::new(SettlementProcessor::new(store.clone(), pricing, &config));
    let scheduler = Arc::new(PayoutScheduler::new(store.clone(), banks, gateway, &config));

    info!(
        hold_days = config.hold_period_days,
        min_payout = config.min_payout_amount,
        currency = %config.currency,
        "Payout ledger configured"
    );

    AppState {
        config: Arc::new(config),
        store,
        processor,
        scheduler,
        rate_limiter: RateLimitLayer::default(),
    }
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database initialized");
    Ok(pool)
}
