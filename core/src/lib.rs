//! # Stocksync Core
//!
//! Core types and collaborator traits for asynchronous stock reconciliation.
//!
//! A sale committed by the sales service is announced on the broker as a
//! [`SaleRecorded`](event::SaleRecorded) event. The inventory service consumes
//! the event and decrements stock for every line item inside one row-locked
//! transaction per message.
//!
//! ## Modules
//!
//! - [`event`]: domain ids, line items and the [`DomainEvent`](event::DomainEvent) trait
//! - [`envelope`]: JSON wire codec with typed validation of every line item
//! - [`event_bus`]: producer / subscriber traits implemented by broker adapters
//! - [`inventory`]: transactional inventory store used by the stock adjuster
//! - [`sale`]: sale persistence collaborator used before publishing
//!
//! ## Flow
//!
//! ```text
//! register sale ──► SaleStore (commit) ──► EventPublisher ──► broker
//!                                                               │
//!                    InventoryStore ◄── StockAdjuster ◄── SalesConsumer
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use chrono::{DateTime, Utc};

pub mod envelope;
pub mod event;
pub mod event_bus;
pub mod inventory;
pub mod sale;

pub use envelope::{LineItemEntry, MalformedEventError, MalformedItem, SaleEnvelope};
pub use event::{DomainEvent, LineItem, ProductId, SaleId, SaleRecorded};
pub use event_bus::{
    BrokerMessage, Delivery, EventBusError, EventProducer, EventSubscriber, MessageStream,
    ProducerFactory,
};
pub use inventory::{InventoryStore, InventoryTransaction, StockError};
pub use sale::{SaleError, SaleReceipt, SaleStore};

/// Topic the sales service publishes [`SaleRecorded`] events to.
pub const SALES_TOPIC: &str = "topic_ventas";

/// Consumer group of the inventory service.
pub const INVENTORY_CONSUMER_GROUP: &str = "inventario-group";

/// Broker bootstrap address used when none is configured.
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "kafka:9092";
