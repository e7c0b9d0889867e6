//! `register-sale`: record a sale and announce it on the sales topic.

use crate::config::Config;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use stocksync_core::event::{LineItem, ProductId};
use stocksync_core::sale::SaleReceipt;
use stocksync_postgres::PostgresSaleStore;
use stocksync_redpanda::RedpandaProducerFactory;
use stocksync_runtime::{EventPublisher, ProducerConnectionManager, SaleService};

/// Record a sale and publish its `SaleRecorded` event.
#[derive(Debug, Parser)]
#[command(name = "register-sale", version)]
pub struct Args {
    /// Line items as `PRODUCT_ID:QUANTITY`, e.g. `42:3 7:1`
    #[arg(required = true, value_parser = parse_line_item)]
    pub items: Vec<LineItem>,

    /// Connection URL of the sales database (defaults to `DATABASE_URL`)
    #[arg(long, env = "SALES_DATABASE_URL")]
    pub database_url: Option<String>,
}

/// Parse `PRODUCT_ID:QUANTITY`.
///
/// # Errors
///
/// Returns a message when the item is not two integers separated by `:` or
/// either of them is not positive.
pub fn parse_line_item(raw: &str) -> Result<LineItem, String> {
    let (product, quantity) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected PRODUCT_ID:QUANTITY, got {raw:?}"))?;
    let product: i64 = product
        .trim()
        .parse()
        .map_err(|e| format!("invalid product id {product:?}: {e}"))?;
    let quantity: i64 = quantity
        .trim()
        .parse()
        .map_err(|e| format!("invalid quantity {quantity:?}: {e}"))?;

    LineItem::new(ProductId::new(product), quantity).map_err(|e| e.to_string())
}

/// Commit the sale, then publish it.
///
/// A sale that committed is returned even if the event was dropped; the
/// drop is logged.
///
/// # Errors
///
/// Returns an error if the database is unreachable, the broker address is
/// empty, or the sale could not be committed.
pub async fn register(config: &Config, args: Args) -> anyhow::Result<SaleReceipt> {
    let database_url = args.database_url.as_deref().unwrap_or(&config.database.url);
    let pool = stocksync_postgres::connect(database_url, config.database.max_connections)
        .await
        .context("Failed to connect to sales database")?;
    stocksync_postgres::migrate(&pool)
        .await
        .context("Failed to migrate sales database")?;

    let factory = RedpandaProducerFactory::builder()
        .brokers(&config.kafka.bootstrap_servers)
        .client_id("register-sale")
        .build()
        .context("Invalid Kafka configuration")?;
    let connections =
        ProducerConnectionManager::with_policy(Arc::new(factory), config.producer.retry_policy());
    let publisher = EventPublisher::new(Arc::new(connections));

    let service = SaleService::new(Arc::new(PostgresSaleStore::new(pool)), publisher)
        .with_topic(config.kafka.sales_topic.clone());

    service
        .register_sale(args.items)
        .await
        .context("Failed to register sale")
}
