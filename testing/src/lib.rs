//! # Stocksync Testing
//!
//! In-memory doubles for the collaborator traits of `stocksync-core`.
//!
//! - [`InMemoryBroker`]: topics, consumer group offsets and fault switches for
//!   connect, send, flush, subscribe and receive
//! - [`InMemoryInventoryStore`]: per-row async locks, staged writes, an
//!   applied-sales ledger and lock/commit failure injection
//! - [`InMemorySaleStore`]: sequential sale ids
//!
//! ## Example
//!
//! ```
//! use stocksync_core::event::ProductId;
//! use stocksync_testing::{InMemoryBroker, InMemoryInventoryStore};
//!
//! let broker = InMemoryBroker::new();
//! broker.refuse_next_connections(2);
//!
//! let store = InMemoryInventoryStore::with_products([(ProductId::new(7), 10)]);
//! assert_eq!(store.stock(ProductId::new(7)), Some(10));
//! ```

#![allow(clippy::unwrap_used)] // Mutex poison only happens after a test already panicked

pub mod broker;
pub mod inventory;
pub mod sales;

pub use broker::{InMemoryBroker, InMemoryProducer, InMemorySubscriber};
pub use inventory::{InMemoryInventoryStore, InMemoryTransaction};
pub use sales::{InMemorySaleStore, StoredSale};

/// Install a `fmt` subscriber writing through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stocksync_runtime=debug".into()),
        )
        .with_test_writer()
        .try_init()
        .ok();
}
