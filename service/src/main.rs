//! Inventory service.
//!
//! Consumes `SaleRecorded` events from the sales topic and decrements stock.

use inventory_service::{Config, lifecycle, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    info!("Starting inventory service");

    let config = Config::from_env()?;
    info!(
        brokers = %config.kafka.bootstrap_servers,
        topic = %config.kafka.sales_topic,
        "Configuration loaded"
    );

    lifecycle::run(config).await
}
