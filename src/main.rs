//! Order Events Service - Main Entry Point
//!
//! Runs one role per process: `order`, `dispatch`, `drone` or
//! `notification`, taken from the first argument or `SERVICE_ROLE`.

use anyhow::Result;
use tracing::info;

use order_events::logging::init_tracing;
use order_events::services;
use order_events::types::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let role = std::env::args().nth(1);
    let config = ServiceConfig::from_env(role.as_deref())?;

    init_tracing(config.log_format);
    info!("Starting order-events v{}", env!("CARGO_PKG_VERSION"));

    services::run(config).await?;

    Ok(())
}
