//! Broker abstraction used by the publisher and the consumer loop.
//!
//! The traits here split the broker into the three things the stock
//! reconciliation subsystem actually needs:
//!
//! - [`ProducerFactory`]: establish a producer connection (may fail, is retried
//!   by the connection manager)
//! - [`EventProducer`]: send one payload to a topic and flush the outbound buffer
//! - [`EventSubscriber`]: join the configured consumer group on a topic,
//!   stream delivered messages and acknowledge the handled ones
//!
//! # Delivery Semantics
//!
//! Subscribers deliver **at least once**: a message's offset is committed only
//! when the consumer calls [`EventSubscriber::commit`] after handling it. A
//! crash or shutdown before that call replays the message after restart.
//! Ordering holds within a partition only.
//!
//! # Implementations
//!
//! - `stocksync_redpanda`: rdkafka-backed, for production
//! - `stocksync_testing::InMemoryBroker`: for tests
//!
//! # Dyn Compatibility
//!
//! All methods return `Pin<Box<dyn Future>>` so the traits can be used as
//! `Arc<dyn EventProducer>` and `Arc<dyn ProducerFactory>`.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// A single attempt to connect to the broker failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Every connection attempt of the retry budget failed.
    #[error("Broker unavailable after {attempts} connection attempts")]
    BrokerUnavailable {
        /// Attempts made before giving up
        attempts: usize,
    },

    /// Failed to publish a payload to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The outbound buffer could not be flushed.
    #[error("Flush failed: {0}")]
    FlushFailed(String),

    /// Failed to subscribe to a topic.
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error while receiving.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The consumed offset could not be committed.
    #[error("Commit failed: {0}")]
    CommitFailed(String),
}

/// Where a published payload landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Partition the broker assigned
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic the message was read from
    pub topic: String,
    /// Partition the message was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Message key, if any
    pub key: Option<Vec<u8>>,
    /// Raw payload; `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

/// Boxed future returned by broker operations.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventBusError>> + Send + 'a>>;

/// Stream of delivered messages.
///
/// Transport errors are yielded in-band; the stream ends when the underlying
/// consumer stops.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BrokerMessage, EventBusError>> + Send>>;

/// A live producer connection.
pub trait EventProducer: Send + Sync {
    /// Send a payload and wait for the broker's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects or times
    /// out the message.
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a str>,
        payload: &'a [u8],
    ) -> BusFuture<'a, Delivery>;

    /// Block until every buffered message has been acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::FlushFailed`] if the buffer is not drained
    /// within `timeout`.
    fn flush(&self, timeout: Duration) -> BusFuture<'_, ()>;
}

/// Establishes producer connections.
pub trait ProducerFactory: Send + Sync {
    /// Make one connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] when no broker is reachable.
    fn connect(&self) -> BusFuture<'_, Arc<dyn EventProducer>>;
}

/// Subscribes to a topic under a consumer group.
pub trait EventSubscriber: Send + Sync {
    /// Join the consumer group on `topic` and stream its messages.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the broker cannot be
    /// reached or the subscription is rejected.
    fn subscribe<'a>(&'a self, topic: &'a str) -> BusFuture<'a, MessageStream>;

    /// Commit the group's position past `message`.
    ///
    /// Messages that are never committed are delivered again after the group
    /// rejoins.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::CommitFailed`] if there is no live
    /// subscription or the broker rejects the commit.
    fn commit<'a>(&'a self, message: &'a BrokerMessage) -> BusFuture<'a, ()>;

    /// Consumer group this subscriber joins.
    fn consumer_group(&self) -> &str;
}
