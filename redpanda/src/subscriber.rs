use crate::DEFAULT_METADATA_TIMEOUT;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use stocksync_core::event_bus::{
    BrokerMessage, BusFuture, EventBusError, EventSubscriber, MessageStream,
};
use stocksync_core::INVENTORY_CONSUMER_GROUP;
use tokio::sync::Mutex;

/// Consumer-group subscriber backed by an rdkafka [`StreamConsumer`].
///
/// Auto commit is off. A message's offset is committed synchronously when the
/// caller passes it to [`EventSubscriber::commit`]; anything delivered but not
/// committed is redelivered after the group rebalances or restarts.
///
/// # Example
///
/// ```no_run
/// use stocksync_redpanda::RedpandaSubscriber;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let subscriber = RedpandaSubscriber::builder()
///     .brokers("localhost:9092")
///     .consumer_group("inventario-group")
///     .auto_offset_reset("earliest")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedpandaSubscriber {
    brokers: String,
    consumer_group: String,
    auto_offset_reset: String,
    session_timeout: Duration,
    metadata_timeout: Duration,
    // Consumer of the latest subscription; commits go through it.
    live: Arc<Mutex<Option<Arc<StreamConsumer>>>>,
}

impl fmt::Debug for RedpandaSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedpandaSubscriber")
            .field("brokers", &self.brokers)
            .field("consumer_group", &self.consumer_group)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("session_timeout", &self.session_timeout)
            .field("metadata_timeout", &self.metadata_timeout)
            .finish_non_exhaustive()
    }
}

impl RedpandaSubscriber {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaSubscriberBuilder {
        RedpandaSubscriberBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Where a group without committed offsets starts reading.
    #[must_use]
    pub fn auto_offset_reset(&self) -> &str {
        &self.auto_offset_reset
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");
        config
    }
}

impl EventSubscriber for RedpandaSubscriber {
    fn subscribe<'a>(&'a self, topic: &'a str) -> BusFuture<'a, MessageStream> {
        Box::pin(async move {
            let failed = |reason: String| EventBusError::SubscriptionFailed {
                topic: topic.to_string(),
                reason,
            };

            // The previous consumer leaves the group before a new one joins.
            drop(self.live.lock().await.take());

            let consumer: StreamConsumer = self
                .client_config()
                .create()
                .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;
            let consumer = Arc::new(consumer);

            // Joining a group never fails on its own; ask for the topic's
            // metadata so an unreachable broker is reported here.
            let client = Arc::clone(&consumer);
            let owned_topic = topic.to_string();
            let metadata_timeout = self.metadata_timeout;
            tokio::task::spawn_blocking(move || {
                client
                    .fetch_metadata(Some(&owned_topic), Timeout::After(metadata_timeout))
                    .map(drop)
            })
            .await
            .map_err(|e| failed(format!("Metadata request aborted: {e}")))?
            .map_err(|e| failed(format!("Broker unreachable: {e}")))?;

            consumer
                .subscribe(&[topic])
                .map_err(|e| failed(format!("Failed to subscribe: {e}")))?;

            *self.live.lock().await = Some(Arc::clone(&consumer));

            tracing::info!(
                topic,
                consumer_group = %self.consumer_group,
                auto_offset_reset = %self.auto_offset_reset,
                "Subscribed to topic"
            );

            let stream = async_stream::stream! {
                let mut messages = consumer.stream();

                while let Some(received) = messages.next().await {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => {
                            yield Err(EventBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            )));
                            continue;
                        }
                    };

                    let delivered = BrokerMessage {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(<[u8]>::to_vec),
                        payload: message.payload().map(<[u8]>::to_vec),
                    };
                    drop(message);

                    yield Ok(delivered);
                }

                tracing::debug!("Consumer stream ended");
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn commit<'a>(&'a self, message: &'a BrokerMessage) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let consumer = self
                .live
                .lock()
                .await
                .clone()
                .ok_or_else(|| EventBusError::CommitFailed("Not subscribed".to_string()))?;

            let mut position = TopicPartitionList::new();
            position
                .add_partition_offset(
                    &message.topic,
                    message.partition,
                    Offset::Offset(message.offset + 1),
                )
                .map_err(|e| EventBusError::CommitFailed(format!("Invalid commit position: {e}")))?;

            tokio::task::spawn_blocking(move || consumer.commit(&position, CommitMode::Sync))
                .await
                .map_err(|e| EventBusError::CommitFailed(format!("Commit aborted: {e}")))?
                .map_err(|e| EventBusError::CommitFailed(e.to_string()))?;

            tracing::debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Committed offset"
            );
            Ok(())
        })
    }

    fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

/// Builder for [`RedpandaSubscriber`].
#[derive(Default)]
pub struct RedpandaSubscriberBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
    metadata_timeout: Option<Duration>,
}

impl RedpandaSubscriberBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group to join.
    ///
    /// Default: `"inventario-group"`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Start position for a group without committed offsets:
    /// `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Time the subscription waits for topic metadata.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = Some(timeout);
        self
    }

    /// Build the subscriber. No connection is made yet.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no brokers were set.
    pub fn build(self) -> Result<RedpandaSubscriber, EventBusError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;

        Ok(RedpandaSubscriber {
            brokers,
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| INVENTORY_CONSUMER_GROUP.to_string()),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
            metadata_timeout: self.metadata_timeout.unwrap_or(DEFAULT_METADATA_TIMEOUT),
            live: Arc::new(Mutex::new(None)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_inventory_service() {
        let subscriber = RedpandaSubscriber::builder().brokers("kafka:9092").build().unwrap();

        assert_eq!(subscriber.consumer_group(), "inventario-group");
        assert_eq!(subscriber.auto_offset_reset(), "earliest");

        let config = subscriber.client_config();
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("group.id"), Some("inventario-group"));
    }

    #[test]
    fn build_requires_brokers() {
        assert!(RedpandaSubscriber::builder().build().is_err());
    }

    #[tokio::test]
    async fn unreachable_broker_fails_subscription() {
        let subscriber = RedpandaSubscriber::builder()
            .brokers("127.0.0.1:1")
            .metadata_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        assert!(matches!(
            subscriber.subscribe("topic_ventas").await,
            Err(EventBusError::SubscriptionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn commit_without_subscription_fails() {
        let subscriber = RedpandaSubscriber::builder().brokers("kafka:9092").build().unwrap();
        let message = BrokerMessage {
            topic: "topic_ventas".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: None,
        };

        assert!(matches!(
            subscriber.commit(&message).await,
            Err(EventBusError::CommitFailed(_))
        ));
    }
}
