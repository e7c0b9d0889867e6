//! Producer connection manager and event publisher.
//!
//! [`ProducerConnectionManager`] owns the process-wide producer connection. It
//! is created once at service startup and shared by handle; the connection
//! inside it is established lazily on the first publish.
//!
//! - A cached connection is reused for the lifetime of the process.
//! - When no connection is cached, creation is retried according to the
//!   [`RetryPolicy`] (5 attempts, 5 s apart by default).
//! - If the budget is spent the cache stays empty, so the next call starts a
//!   fresh sequence. There is no circuit breaker: under a sustained broker
//!   outage every publish pays the full retry delay.
//! - Creation is serialized by an async mutex, so concurrent first callers
//!   never open more than one connection.
//!
//! [`EventPublisher`] never fails its caller. It returns a [`PublishOutcome`]
//! and logs dropped events, because a sale must commit whether or not the
//! broker is reachable.

use crate::metrics::ProducerMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stocksync_core::envelope;
use stocksync_core::event::DomainEvent;
use stocksync_core::event_bus::{Delivery, EventBusError, EventProducer, ProducerFactory};
use thiserror::Error;
use tokio::sync::Mutex;

/// Time allowed for the outbound buffer to drain after a send.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Lazily connected, process-wide producer handle.
pub struct ProducerConnectionManager {
    factory: Arc<dyn ProducerFactory>,
    policy: RetryPolicy,
    connection: Mutex<Option<Arc<dyn EventProducer>>>,
}

impl ProducerConnectionManager {
    /// Create a manager with the default connect policy.
    #[must_use]
    pub fn new(factory: Arc<dyn ProducerFactory>) -> Self {
        Self::with_policy(factory, RetryPolicy::default())
    }

    /// Create a manager with a custom connect policy.
    #[must_use]
    pub fn with_policy(factory: Arc<dyn ProducerFactory>, policy: RetryPolicy) -> Self {
        Self {
            factory,
            policy,
            connection: Mutex::new(None),
        }
    }

    /// Return the cached connection, connecting first if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::BrokerUnavailable`] when every attempt of the
    /// retry budget failed. Nothing is cached in that case.
    pub async fn get_connection(&self) -> Result<Arc<dyn EventProducer>, EventBusError> {
        let mut slot = self.connection.lock().await;
        if let Some(producer) = slot.as_ref() {
            return Ok(Arc::clone(producer));
        }

        tracing::info!(
            max_attempts = self.policy.max_attempts,
            "Connecting producer to broker"
        );

        match retry_with_backoff(&self.policy, || self.factory.connect()).await {
            Ok(producer) => {
                tracing::info!("Producer connected");
                *slot = Some(Arc::clone(&producer));
                Ok(producer)
            }
            Err(e) => {
                tracing::error!(
                    attempts = self.policy.max_attempts,
                    error = %e,
                    "Producer unavailable, events will not be sent"
                );
                Err(EventBusError::BrokerUnavailable {
                    attempts: self.policy.max_attempts,
                })
            }
        }
    }

    /// Whether a connection is currently cached.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// The connect policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Why an event was not published.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The event could not be serialized.
    #[error("Failed to encode event: {0}")]
    Encode(String),

    /// The broker could not be reached or rejected the message.
    #[error(transparent)]
    Bus(#[from] EventBusError),
}

/// Result of a publish attempt. Publishing never returns an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker acknowledged the event.
    Delivered(Delivery),
    /// The event was logged and dropped.
    Dropped(PublishError),
}

impl PublishOutcome {
    /// Whether the broker acknowledged the event.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

/// Publishes domain events through a shared [`ProducerConnectionManager`].
///
/// # Example
///
/// ```rust,ignore
/// let connections = Arc::new(ProducerConnectionManager::new(factory));
/// let publisher = EventPublisher::new(connections);
///
/// let outcome = publisher.publish(SALES_TOPIC, &sale_recorded).await;
/// if !outcome.is_delivered() {
///     // already logged; the sale stays committed
/// }
/// ```
#[derive(Clone)]
pub struct EventPublisher {
    connections: Arc<ProducerConnectionManager>,
    flush_timeout: Duration,
}

impl EventPublisher {
    /// Create a publisher over a shared connection manager.
    #[must_use]
    pub const fn new(connections: Arc<ProducerConnectionManager>) -> Self {
        Self {
            connections,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    /// Override the flush timeout.
    #[must_use]
    pub const fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// The shared connection manager.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ProducerConnectionManager> {
        &self.connections
    }

    /// Encode `event`, send it to `topic` and flush.
    ///
    /// Returns only after the broker acknowledged the event or the attempt was
    /// given up. Failures are logged and reported as
    /// [`PublishOutcome::Dropped`].
    pub async fn publish<E: DomainEvent>(&self, topic: &str, event: &E) -> PublishOutcome {
        let event_type = event.event_type();

        let payload = match envelope::encode(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(topic, event_type, error = %e, "Dropping event that cannot be encoded");
                ProducerMetrics::record_dropped(topic);
                return PublishOutcome::Dropped(PublishError::Encode(e.to_string()));
            }
        };

        let producer = match self.connections.get_connection().await {
            Ok(producer) => producer,
            Err(e) => {
                tracing::error!(
                    topic,
                    event_type,
                    payload = %String::from_utf8_lossy(&payload),
                    error = %e,
                    "Dropping event: producer not available"
                );
                ProducerMetrics::record_dropped(topic);
                return PublishOutcome::Dropped(e.into());
            }
        };

        let key = event.partition_key();
        let started = Instant::now();
        tracing::debug!(topic, event_type, "Sending event");

        let delivery = match producer.send(topic, key.as_deref(), &payload).await {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::error!(topic, event_type, error = %e, "Failed to send event");
                ProducerMetrics::record_dropped(topic);
                return PublishOutcome::Dropped(e.into());
            }
        };

        if let Err(e) = producer.flush(self.flush_timeout).await {
            tracing::error!(topic, event_type, error = %e, "Failed to flush event");
            ProducerMetrics::record_dropped(topic);
            return PublishOutcome::Dropped(e.into());
        }

        ProducerMetrics::record_publish(topic, started.elapsed());
        tracing::info!(
            topic,
            event_type,
            partition = delivery.partition,
            offset = delivery.offset,
            "Event published"
        );
        PublishOutcome::Delivered(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocksync_core::event::{LineItem, ProductId, SaleId, SaleRecorded};
    use stocksync_testing::InMemoryBroker;

    fn sale(id: i64) -> SaleRecorded {
        SaleRecorded::new(
            SaleId::new(id),
            vec![LineItem::new(ProductId::new(7), 3).unwrap()],
        )
    }

    fn publisher_for(broker: &InMemoryBroker, policy: RetryPolicy) -> EventPublisher {
        let factory: Arc<dyn ProducerFactory> = Arc::new(broker.clone());
        EventPublisher::new(Arc::new(ProducerConnectionManager::with_policy(factory, policy)))
    }

    #[tokio::test]
    async fn caches_connection_after_first_success() {
        let broker = InMemoryBroker::new();
        let manager = ProducerConnectionManager::with_policy(
            Arc::new(broker.clone()),
            RetryPolicy::fixed(5, Duration::from_millis(1)),
        );

        manager.get_connection().await.unwrap();
        manager.get_connection().await.unwrap();

        assert!(manager.is_connected().await);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_broker_restarts_budget_on_every_call() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let manager = ProducerConnectionManager::new(Arc::new(broker.clone()));

        let started = tokio::time::Instant::now();
        let first = manager.get_connection().await;
        assert_eq!(
            first.err(),
            Some(EventBusError::BrokerUnavailable { attempts: 5 })
        );
        assert_eq!(broker.connect_attempts(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert!(!manager.is_connected().await);

        let second = manager.get_connection().await;
        assert!(second.is_err());
        assert_eq!(broker.connect_attempts(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_first_callers_share_one_connection() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connections(2);
        let manager = Arc::new(ProducerConnectionManager::new(Arc::new(broker.clone())));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get_connection().await.is_ok() })
            })
            .collect();

        for caller in callers {
            assert!(caller.await.unwrap());
        }
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.live_connections(), 1);
    }

    #[tokio::test]
    async fn publish_delivers_and_flushes() {
        let broker = InMemoryBroker::new();
        let publisher = publisher_for(&broker, RetryPolicy::fixed(1, Duration::ZERO));

        let outcome = publisher.publish("topic_ventas", &sale(42)).await;

        assert!(outcome.is_delivered());
        let messages = broker.messages("topic_ventas");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key.as_deref(), Some(b"42".as_slice()));
        assert_eq!(broker.flush_count(), 1);

        let payload: serde_json::Value =
            serde_json::from_slice(messages[0].payload.as_deref().unwrap()).unwrap();
        assert_eq!(payload["venta_id"], 42);
    }

    #[tokio::test]
    async fn publish_drops_when_broker_is_down() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let publisher = publisher_for(&broker, RetryPolicy::fixed(2, Duration::ZERO));

        let outcome = publisher.publish("topic_ventas", &sale(1)).await;

        assert_eq!(
            outcome,
            PublishOutcome::Dropped(PublishError::Bus(EventBusError::BrokerUnavailable {
                attempts: 2
            }))
        );
        assert!(broker.messages("topic_ventas").is_empty());
    }

    #[tokio::test]
    async fn publish_drops_when_send_fails_and_keeps_connection() {
        let broker = InMemoryBroker::new();
        let publisher = publisher_for(&broker, RetryPolicy::fixed(1, Duration::ZERO));
        broker.fail_next_sends(1);

        let first = publisher.publish("topic_ventas", &sale(1)).await;
        let second = publisher.publish("topic_ventas", &sale(2)).await;

        assert!(matches!(
            first,
            PublishOutcome::Dropped(PublishError::Bus(EventBusError::PublishFailed { .. }))
        ));
        assert!(second.is_delivered());
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.messages("topic_ventas").len(), 1);
    }

    #[tokio::test]
    async fn publish_drops_when_flush_fails_and_keeps_connection() {
        let broker = InMemoryBroker::new();
        let publisher = publisher_for(&broker, RetryPolicy::fixed(1, Duration::ZERO));
        broker.fail_next_flushes(1);

        let first = publisher.publish("topic_ventas", &sale(1)).await;
        let second = publisher.publish("topic_ventas", &sale(2)).await;

        assert!(matches!(
            first,
            PublishOutcome::Dropped(PublishError::Bus(EventBusError::FlushFailed(_)))
        ));
        assert!(second.is_delivered());
        assert!(publisher.connections().is_connected().await);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.flush_count(), 1);
    }
}
