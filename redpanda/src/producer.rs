use crate::{DEFAULT_METADATA_TIMEOUT, DEFAULT_SEND_TIMEOUT};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use stocksync_core::event_bus::{BusFuture, Delivery, EventBusError, EventProducer, ProducerFactory};

/// Creates rdkafka producers.
///
/// rdkafka connects lazily, so [`connect`](ProducerFactory::connect) asks the
/// new producer for cluster metadata and only hands it out once a broker
/// answered. That makes an unreachable broker fail the attempt instead of the
/// first send.
///
/// # Example
///
/// ```no_run
/// use stocksync_redpanda::RedpandaProducerFactory;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = RedpandaProducerFactory::builder()
///     .brokers("localhost:9092")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RedpandaProducerFactory {
    config: ClientConfig,
    brokers: String,
    timeout: Duration,
    metadata_timeout: Duration,
}

impl RedpandaProducerFactory {
    /// A factory for `brokers` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if `brokers` is empty.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaProducerFactoryBuilder {
        RedpandaProducerFactoryBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

impl ProducerFactory for RedpandaProducerFactory {
    fn connect(&self) -> BusFuture<'_, Arc<dyn EventProducer>> {
        Box::pin(async move {
            let producer: FutureProducer = self.config.create().map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

            // Metadata requests block inside librdkafka.
            let client = producer.clone();
            let metadata_timeout = self.metadata_timeout;
            tokio::task::spawn_blocking(move || {
                client
                    .client()
                    .fetch_metadata(None, Timeout::After(metadata_timeout))
                    .map(drop)
            })
            .await
            .map_err(|e| EventBusError::ConnectionFailed(format!("Metadata request aborted: {e}")))?
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!(
                    "No broker reachable at {}: {e}",
                    self.brokers
                ))
            })?;

            tracing::info!(brokers = %self.brokers, "Kafka producer connected");

            let producer: Arc<dyn EventProducer> = Arc::new(RedpandaProducer {
                producer,
                timeout: self.timeout,
            });
            Ok(producer)
        })
    }
}

/// Builder for [`RedpandaProducerFactory`].
#[derive(Default)]
pub struct RedpandaProducerFactoryBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    metadata_timeout: Option<Duration>,
}

impl RedpandaProducerFactoryBuilder {
    /// Comma-separated bootstrap servers (e.g. `"kafka:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Client id reported to the broker.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Acknowledgement mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"1"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery timeout of a single send.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Time a connection attempt waits for cluster metadata.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = Some(timeout);
        self
    }

    /// Build the factory. No connection is made yet.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no brokers were set.
    pub fn build(self) -> Result<RedpandaProducerFactory, EventBusError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_SEND_TIMEOUT);
        let acks = self.producer_acks.unwrap_or_else(|| "1".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("compression.type", &compression);
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }

        tracing::debug!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            "Producer factory configured"
        );

        Ok(RedpandaProducerFactory {
            config,
            brokers,
            timeout,
            metadata_timeout: self.metadata_timeout.unwrap_or(DEFAULT_METADATA_TIMEOUT),
        })
    }
}

/// A connected rdkafka producer.
pub struct RedpandaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl EventProducer for RedpandaProducer {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a str>,
        payload: &'a [u8],
    ) -> BusFuture<'a, Delivery> {
        Box::pin(async move {
            let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic).payload(payload);
            if let Some(key) = key {
                record = record.key(key);
            }

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(topic, partition, offset, "Message delivered");
                    Ok(Delivery { partition, offset })
                }
                Err((kafka_error, _)) => Err(EventBusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                }),
            }
        })
    }

    fn flush(&self, timeout: Duration) -> BusFuture<'_, ()> {
        Box::pin(async move {
            let producer = self.producer.clone();
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| EventBusError::FlushFailed(e.to_string()))?
                .map_err(|e| EventBusError::FlushFailed(e.to_string()))
        })
    }
}
