//! Record a sale and publish its event to the sales topic.

use clap::Parser;
use inventory_service::sale_cli::{self, Args};
use inventory_service::{Config, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let receipt = sale_cli::register(&config, args).await?;

    println!("sale {} recorded at {}", receipt.sale_id, receipt.recorded_at.to_rfc3339());
    Ok(())
}
