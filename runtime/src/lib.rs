//! # Stocksync Runtime
//!
//! The moving parts of stock reconciliation, written against the collaborator
//! traits in `stocksync-core` so that brokers and stores can be swapped.
//!
//! ## Components
//!
//! - **[`ProducerConnectionManager`]**: lazily connects one producer per
//!   process, with a bounded fixed-delay retry
//! - **[`EventPublisher`]**: encodes a domain event, sends and flushes it, and
//!   reports a [`PublishOutcome`] instead of failing the caller
//! - **[`SaleService`]**: commits a sale, then publishes `SaleRecorded`
//! - **[`StockAdjuster`]**: applies one sale event in one row-locked
//!   transaction, all or nothing
//! - **[`SalesConsumer`]**: the long-lived loop feeding the adjuster from the
//!   sales topic, with a supervised shutdown path
//!
//! ## Example
//!
//! ```ignore
//! use stocksync_runtime::{SalesConsumer, ConsumerConfig};
//! use tokio::sync::broadcast;
//!
//! let (shutdown_tx, _) = broadcast::channel(1);
//! let consumer = SalesConsumer::with_config(subscriber, store, ConsumerConfig::default());
//! let handle = consumer.spawn(shutdown_tx);
//!
//! // later
//! let exit = handle.shutdown().await?;
//! ```

/// Bounded retry with a fixed delay
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Producer connection manager and event publisher
pub mod producer;

/// Sale registration and event publication
pub mod sales;

/// Row-locked stock adjustment per sale event
pub mod adjustment;

/// Sales consumer loop and its supervision handle
pub mod consumer;

pub use adjustment::{
    AdjustmentError, AdjustmentOutcome, AdjustmentReport, StockAdjuster, StockChange, adjust_stock,
};
pub use consumer::{
    ConsumerConfig, ConsumerExit, ConsumerHandle, ConsumerState, MessageOutcome, SalesConsumer,
};
pub use producer::{EventPublisher, ProducerConnectionManager, PublishError, PublishOutcome};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use sales::SaleService;
