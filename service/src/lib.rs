//! Inventory service: applies sale events from Kafka to `PostgreSQL` stock.
//!
//! The `inventory-service` binary hosts the consumer loop; `register-sale`
//! records a sale and publishes its event, which is what the sales service
//! does on every request.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod lifecycle;
pub mod sale_cli;
pub mod telemetry;

pub use config::{Config, ConfigError};
