//! Sales consumer loop.
//!
//! One long-lived task per inventory service. It joins the consumer group on
//! the sales topic and applies every delivered sale event through a
//! [`StockAdjuster`].
//!
//! # State Machine
//!
//! ```text
//! Starting ──subscribe ok──► Connected ──► Consuming ──► Stopped
//!     │                                                    ▲
//!     └──────────────subscribe failed (fatal)──────────────┘
//! ```
//!
//! - A failed subscription is fatal. The loop does not retry; the hosting
//!   process is expected to exit and be restarted.
//! - Every message is handled to completion and its offset committed before
//!   the next one is read. Undecodable messages and rolled back adjustments
//!   are logged and skipped, never redelivered.
//! - The shutdown signal is only observed between messages, so a stock
//!   transaction is never abandoned halfway and a handled message is never
//!   left uncommitted by a shutdown.

use crate::adjustment::{AdjustmentError, AdjustmentOutcome, AdjustmentReport, StockAdjuster};
use crate::metrics::ConsumerMetrics;
use futures::StreamExt;
use std::sync::Arc;
use stocksync_core::envelope::{self, MalformedEventError};
use stocksync_core::event::SaleId;
use stocksync_core::event_bus::{BrokerMessage, EventBusError, EventSubscriber};
use stocksync_core::inventory::InventoryStore;
use stocksync_core::SALES_TOPIC;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle};

/// Lifecycle of a [`SalesConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Joining the consumer group.
    Starting,
    /// Subscribed, waiting for the first message.
    Connected,
    /// Handling messages.
    Consuming,
    /// The loop has exited.
    Stopped,
}

/// Why the consumer loop exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The shutdown signal was received.
    Shutdown,
    /// The broker closed the message stream.
    StreamEnded,
    /// The subscription could not be established.
    BootstrapFailed(EventBusError),
}

/// What happened to one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Stock adjustments were committed.
    Applied(AdjustmentReport),
    /// The sale had already been applied.
    Duplicate(SaleId),
    /// The payload could not be decoded; the message was skipped.
    Malformed(MalformedEventError),
    /// The adjustment failed and was rolled back; the message was skipped.
    RolledBack(AdjustmentError),
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Topic carrying sale events
    pub topic: String,
    /// Skip sales that were already applied
    pub deduplicate_sales: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: SALES_TOPIC.to_string(),
            deduplicate_sales: true,
        }
    }
}

/// Applies sale events from the broker to the inventory store.
pub struct SalesConsumer<S> {
    subscriber: Arc<dyn EventSubscriber>,
    adjuster: StockAdjuster<S>,
    topic: String,
    state: watch::Sender<ConsumerState>,
}

impl<S: InventoryStore + 'static> SalesConsumer<S> {
    /// Create a consumer with the default configuration.
    #[must_use]
    pub fn new(subscriber: Arc<dyn EventSubscriber>, store: Arc<S>) -> Self {
        Self::with_config(subscriber, store, ConsumerConfig::default())
    }

    /// Create a consumer with an explicit configuration.
    #[must_use]
    pub fn with_config(
        subscriber: Arc<dyn EventSubscriber>,
        store: Arc<S>,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Starting);
        Self {
            subscriber,
            adjuster: StockAdjuster::new(store).with_deduplication(config.deduplicate_sales),
            topic: config.topic,
            state,
        }
    }

    /// Observe state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Spawn the loop on the current runtime.
    ///
    /// The returned handle keeps `shutdown` alive; calling
    /// [`ConsumerHandle::shutdown`] broadcasts on it.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Sender<()>) -> ConsumerHandle {
        let state = self.state();
        let receiver = shutdown.subscribe();
        let task = tokio::spawn(async move { self.run(receiver).await });
        ConsumerHandle {
            state,
            shutdown,
            task,
        }
    }

    /// Run the loop until shutdown, end of stream or bootstrap failure.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> ConsumerExit {
        let group = self.subscriber.consumer_group().to_string();
        let topic = self.topic.as_str();
        self.state.send_replace(ConsumerState::Starting);
        tracing::info!(topic, group = %group, "Sales consumer starting");

        let subscription = tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::info!(topic, "Sales consumer received shutdown signal before subscribing");
                return self.stop(ConsumerExit::Shutdown);
            }
            subscription = self.subscriber.subscribe(topic) => subscription,
        };

        let mut stream = match subscription {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    topic,
                    group = %group,
                    error = %e,
                    "Failed to subscribe, sales consumer is stopping for good"
                );
                return self.stop(ConsumerExit::BootstrapFailed(e));
            }
        };

        self.state.send_replace(ConsumerState::Connected);
        tracing::info!(topic, group = %group, "Sales consumer subscribed");
        self.state.send_replace(ConsumerState::Consuming);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!(topic, "Sales consumer received shutdown signal");
                    return self.stop(ConsumerExit::Shutdown);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    self.handle_message(&message).await;
                    if let Err(e) = self.subscriber.commit(&message).await {
                        ConsumerMetrics::record_commit_error();
                        tracing::warn!(
                            topic,
                            partition = message.partition,
                            offset = message.offset,
                            error = %e,
                            "Failed to commit offset, message may be redelivered"
                        );
                    }
                }
                Some(Err(e)) => {
                    ConsumerMetrics::record_receive_error();
                    tracing::error!(topic, error = %e, "Error receiving message");
                }
                None => {
                    tracing::warn!(topic, "Message stream ended");
                    return self.stop(ConsumerExit::StreamEnded);
                }
            }
        }
    }

    /// Decode and apply one delivered message.
    pub async fn handle_message(&self, message: &BrokerMessage) -> MessageOutcome {
        ConsumerMetrics::record_consumed();

        let Some(payload) = message.payload.as_deref() else {
            return Self::skip_malformed(message, MalformedEventError::EmptyPayload);
        };

        let envelope = match envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => return Self::skip_malformed(message, e),
        };

        tracing::debug!(
            partition = message.partition,
            offset = message.offset,
            sale_id = %envelope.sale_id,
            items = envelope.entries.len(),
            "Applying sale event"
        );

        match self.adjuster.apply(&envelope).await {
            Ok(AdjustmentOutcome::Applied(report)) => MessageOutcome::Applied(report),
            Ok(AdjustmentOutcome::Duplicate(sale_id)) => {
                ConsumerMetrics::record_duplicate();
                MessageOutcome::Duplicate(sale_id)
            }
            Err(e) => {
                ConsumerMetrics::record_rolled_back();
                tracing::error!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping message after rollback"
                );
                MessageOutcome::RolledBack(e)
            }
        }
    }

    fn skip_malformed(message: &BrokerMessage, error: MalformedEventError) -> MessageOutcome {
        ConsumerMetrics::record_malformed();
        tracing::warn!(
            partition = message.partition,
            offset = message.offset,
            payload = %message
                .payload
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default(),
            error = %error,
            "Skipping malformed message"
        );
        MessageOutcome::Malformed(error)
    }

    fn stop(&self, exit: ConsumerExit) -> ConsumerExit {
        self.state.send_replace(ConsumerState::Stopped);
        tracing::info!(topic = %self.topic, exit = ?exit, "Sales consumer stopped");
        exit
    }
}

/// Handle to a spawned [`SalesConsumer`].
pub struct ConsumerHandle {
    state: watch::Receiver<ConsumerState>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<ConsumerExit>,
}

impl ConsumerHandle {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// A receiver for state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Wait until the loop reaches [`ConsumerState::Stopped`] on its own.
    pub async fn stopped(&mut self) {
        // A closed channel means the task is gone, which is also stopped.
        let _ = self
            .state
            .wait_for(|state| *state == ConsumerState::Stopped)
            .await;
    }

    /// Signal shutdown and wait for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError`] if the consumer task panicked or was aborted.
    pub async fn shutdown(self) -> Result<ConsumerExit, JoinError> {
        // No receivers left means the loop already exited.
        let _ = self.shutdown.send(());
        self.task.await
    }

    /// Stop the task without waiting for the current message.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// A handle that can abort the task after `self` was consumed by
    /// [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }
}
