use payout_ledger::{bootstrap, config::PayoutConfig, server};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,payout_ledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("Starting payout ledger service");

    let config = PayoutConfig::from_env()?;
    let bind_address = config.bind_address.clone();

    let runtime = bootstrap::initialize_app_state(config).await?;
    let scheduler = runtime.state.scheduler.clone();

    let app = server::create_app(runtime.state);
    server::run_server(app, &bind_address, shutdown_signal()).await?;

    // let an in-flight run finish its current seller
    scheduler.shutdown();
    if let Some(task) = runtime.scheduler_task {
        if let Err(e) = task.await {
            error!("Payout scheduler task ended abnormally: {}", e);
        }
    }

    info!("Server stopped");
    Ok(())
}
