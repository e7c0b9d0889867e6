//! Kafka-compatible broker adapter for stock reconciliation.
//!
//! Implements the `event_bus` traits of `stocksync-core` on top of rdkafka, so
//! it works against Redpanda, Apache Kafka or any other Kafka-protocol broker.
//!
//! - [`RedpandaProducerFactory`]: one connection attempt per
//!   [`connect`](stocksync_core::event_bus::ProducerFactory::connect) call; the attempt only succeeds once
//!   the broker answered a metadata request
//! - [`RedpandaProducer`]: keyed sends with a delivery timeout, plus flush
//! - [`RedpandaSubscriber`]: joins a consumer group on one topic, streams raw
//!   messages and commits handled offsets
//!
//! # Delivery Semantics
//!
//! **At-least-once.** Auto commit is disabled. The consumer commits a
//! message's offset through
//! [`EventSubscriber::commit`](stocksync_core::event_bus::EventSubscriber::commit)
//! once it has handled the message, so a crash or shutdown before that commit
//! replays the message. Ordering holds within a partition.
//!
//! # Example
//!
//! ```no_run
//! use stocksync_redpanda::{RedpandaProducerFactory, RedpandaSubscriber};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = RedpandaProducerFactory::builder()
//!     .brokers("kafka:9092")
//!     .producer_acks("all")
//!     .build()?;
//!
//! let subscriber = RedpandaSubscriber::builder()
//!     .brokers("kafka:9092")
//!     .consumer_group("inventario-group")
//!     .auto_offset_reset("earliest")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod producer;
mod subscriber;

pub use producer::{RedpandaProducer, RedpandaProducerFactory, RedpandaProducerFactoryBuilder};
pub use subscriber::{RedpandaSubscriber, RedpandaSubscriberBuilder};

/// Default send timeout.
pub const DEFAULT_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default time allowed for the connect-time metadata request.
pub const DEFAULT_METADATA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
