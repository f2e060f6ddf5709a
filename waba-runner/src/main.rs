use anyhow::Result;
use tokio;
use tracing;
use tracing_subscriber;
use waba_api::run as run_api;
use waba_core::AppContext;
use waba_core::Config;
use waba_delivery::run as run_delivery;
use waba_scheduler::run as run_scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting WABA server");

    let config = Config::from_env();
    let ctx = AppContext::new(config).await?;

    tracing::info!("Application context initialized");

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_scheduler(ctx_clone).await {
            tracing::error!("Scheduler error: {}", e);
        }
    });

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_delivery(ctx_clone).await {
            tracing::error!("Delivery consumer error: {}", e);
        }
    });

    // API server runs in the main task
    tracing::info!("Starting API server");
    run_api(ctx).await?;

    Ok(())
}
