//! In-memory broker.
//!
//! Topics are append-only vectors and every consumer group keeps one offset
//! per topic. A subscriber stream first replays from its group's offset, then
//! waits for new messages until [`InMemoryBroker::close`] is called. The
//! group's offset only moves on [`EventSubscriber::commit`], so a message that
//! was delivered but never committed is replayed to the next subscription.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stocksync_core::INVENTORY_CONSUMER_GROUP;
use stocksync_core::event_bus::{
    BrokerMessage, BusFuture, Delivery, EventBusError, EventProducer, EventSubscriber,
    MessageStream, ProducerFactory,
};
use tokio::sync::Notify;

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<BrokerMessage>>,
    offsets: HashMap<(String, String), usize>,
    available: bool,
    refuse_connections: usize,
    fail_sends: usize,
    fail_flushes: usize,
    refuse_subscriptions: bool,
    receive_errors: VecDeque<String>,
    closed: bool,
}

/// Broker double implementing every `event_bus` trait.
///
/// Clones share the same topics, offsets and fault switches.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    connect_attempts: Arc<AtomicUsize>,
    live_connections: Arc<AtomicUsize>,
    flushes: Arc<AtomicUsize>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// An empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..BrokerState::default()
            })),
            notify: Arc::new(Notify::new()),
            connect_attempts: Arc::new(AtomicUsize::new(0)),
            live_connections: Arc::new(AtomicUsize::new(0)),
            flushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every connection attempt fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    /// Refuse the next `n` connection attempts, then accept again.
    pub fn refuse_next_connections(&self, n: usize) {
        self.state.lock().unwrap().refuse_connections = n;
    }

    /// Reject the next `n` sends.
    pub fn fail_next_sends(&self, n: usize) {
        self.state.lock().unwrap().fail_sends = n;
    }

    /// Fail the next `n` flushes.
    pub fn fail_next_flushes(&self, n: usize) {
        self.state.lock().unwrap().fail_flushes = n;
    }

    /// Make subscriptions fail.
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_subscriptions = refuse;
    }

    /// Yield a transport error to the next stream poll.
    pub fn inject_receive_error(&self, reason: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .receive_errors
            .push_back(reason.into());
        self.notify.notify_waiters();
    }

    /// End every subscriber stream once it has drained its topic.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    /// Append a raw message, bypassing producers.
    pub fn push_raw(&self, topic: &str, key: Option<&[u8]>, payload: Option<&[u8]>) -> Delivery {
        let delivery = {
            let mut state = self.state.lock().unwrap();
            let log = state.topics.entry(topic.to_string()).or_default();
            let offset = i64::try_from(log.len()).unwrap_or(i64::MAX);
            log.push(BrokerMessage {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: key.map(<[u8]>::to_vec),
                payload: payload.map(<[u8]>::to_vec),
            });
            Delivery {
                partition: 0,
                offset,
            }
        };
        self.notify.notify_waiters();
        delivery
    }

    /// Everything appended to `topic` so far.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        self.state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Committed offset of `group` on `topic` (next message to deliver).
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .offsets
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Connection attempts made through [`ProducerFactory::connect`].
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful connections.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::SeqCst)
    }

    /// Flushes performed by any producer.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// A subscriber joining `group`.
    #[must_use]
    pub fn subscriber(&self, group: impl Into<String>) -> InMemorySubscriber {
        InMemorySubscriber {
            broker: self.clone(),
            group: group.into(),
        }
    }

    fn try_connect(&self) -> Result<(), EventBusError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.available {
            return Err(EventBusError::ConnectionFailed(
                "no brokers available".to_string(),
            ));
        }
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(EventBusError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }
        drop(state);
        self.live_connections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next_at(&self, topic: &str, position: usize) -> Next {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.receive_errors.pop_front() {
            return Next::Error(reason);
        }
        let message = state
            .topics
            .get(topic)
            .and_then(|log| log.get(position))
            .cloned();
        match message {
            Some(message) => Next::Message(message),
            None if state.closed => Next::Closed,
            None => Next::Wait,
        }
    }

    fn commit_past(&self, group: &str, message: &BrokerMessage) -> Result<(), EventBusError> {
        let next = message
            .offset
            .checked_add(1)
            .and_then(|next| usize::try_from(next).ok())
            .ok_or_else(|| EventBusError::CommitFailed(format!("invalid offset {}", message.offset)))?;
        self.state
            .lock()
            .unwrap()
            .offsets
            .insert((group.to_string(), message.topic.clone()), next);
        Ok(())
    }
}

enum Next {
    Message(BrokerMessage),
    Error(String),
    Wait,
    Closed,
}

impl ProducerFactory for InMemoryBroker {
    fn connect(&self) -> BusFuture<'_, Arc<dyn EventProducer>> {
        Box::pin(async move {
            self.try_connect()?;
            let producer: Arc<dyn EventProducer> = Arc::new(InMemoryProducer {
                broker: self.clone(),
            });
            Ok(producer)
        })
    }
}

/// Producer handed out by [`InMemoryBroker`].
pub struct InMemoryProducer {
    broker: InMemoryBroker,
}

impl EventProducer for InMemoryProducer {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: Option<&'a str>,
        payload: &'a [u8],
    ) -> BusFuture<'a, Delivery> {
        Box::pin(async move {
            {
                let mut state = self.broker.state.lock().unwrap();
                if state.fail_sends > 0 {
                    state.fail_sends -= 1;
                    return Err(EventBusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: "message timed out".to_string(),
                    });
                }
            }
            Ok(self
                .broker
                .push_raw(topic, key.map(str::as_bytes), Some(payload)))
        })
    }

    fn flush(&self, _timeout: Duration) -> BusFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            if state.fail_flushes > 0 {
                state.fail_flushes -= 1;
                return Err(EventBusError::FlushFailed("flush timed out".to_string()));
            }
            drop(state);
            self.broker.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Subscriber bound to one consumer group of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemorySubscriber {
    broker: InMemoryBroker,
    group: String,
}

impl EventSubscriber for InMemoryBroker {
    fn subscribe<'a>(&'a self, topic: &'a str) -> BusFuture<'a, MessageStream> {
        Box::pin(async move {
            self.subscriber(INVENTORY_CONSUMER_GROUP)
                .subscribe(topic)
                .await
        })
    }

    fn commit<'a>(&'a self, message: &'a BrokerMessage) -> BusFuture<'a, ()> {
        Box::pin(async move { self.commit_past(INVENTORY_CONSUMER_GROUP, message) })
    }

    fn consumer_group(&self) -> &str {
        INVENTORY_CONSUMER_GROUP
    }
}

impl EventSubscriber for InMemorySubscriber {
    fn subscribe<'a>(&'a self, topic: &'a str) -> BusFuture<'a, MessageStream> {
        Box::pin(async move {
            if self.broker.state.lock().unwrap().refuse_subscriptions {
                return Err(EventBusError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: "broker transport failure".to_string(),
                });
            }

            let broker = self.broker.clone();
            let topic = topic.to_string();
            let mut position = broker.committed_offset(&self.group, &topic);

            let stream: MessageStream = Box::pin(async_stream::stream! {
                loop {
                    // Registered before checking so a push in between is not missed.
                    let notified = broker.notify.notified();
                    match broker.next_at(&topic, position) {
                        Next::Message(message) => {
                            position += 1;
                            yield Ok(message);
                        }
                        Next::Error(reason) => yield Err(EventBusError::TransportError(reason)),
                        Next::Closed => break,
                        Next::Wait => notified.await,
                    }
                }
            });
            Ok(stream)
        })
    }

    fn commit<'a>(&'a self, message: &'a BrokerMessage) -> BusFuture<'a, ()> {
        Box::pin(async move { self.broker.commit_past(&self.group, message) })
    }

    fn consumer_group(&self) -> &str {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn groups_keep_separate_offsets() {
        let broker = InMemoryBroker::new();
        broker.push_raw("t", None, Some(b"a"));
        broker.push_raw("t", None, Some(b"b"));
        broker.close();

        let g1 = broker.subscriber("g1");
        let first: Vec<_> = g1.subscribe("t").await.unwrap().collect().await;
        for message in &first {
            g1.commit(message.as_ref().unwrap()).await.unwrap();
        }
        let second: Vec<_> = broker.subscriber("g2").subscribe("t").await.unwrap().collect().await;
        let again: Vec<_> = broker.subscriber("g1").subscribe("t").await.unwrap().collect().await;

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(again.is_empty());
        assert_eq!(broker.committed_offset("g1", "t"), 2);
        assert_eq!(broker.committed_offset("g2", "t"), 0);
    }

    #[tokio::test]
    async fn offset_moves_only_on_commit() {
        let broker = InMemoryBroker::new();
        broker.push_raw("t", None, Some(b"a"));
        broker.push_raw("t", None, Some(b"b"));
        let subscriber = broker.subscriber("g");
        let mut stream = subscriber.subscribe("t").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        stream.next().await.unwrap().unwrap();
        assert_eq!(broker.committed_offset("g", "t"), 0);

        subscriber.commit(&first).await.unwrap();
        assert_eq!(broker.committed_offset("g", "t"), 1);

        drop(stream);
        let replay = subscriber.subscribe("t").await.unwrap();
        broker.close();
        let replayed: Vec<_> = replay.collect().await;
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].as_ref().unwrap().payload.as_deref(), Some(b"b".as_slice()));
    }

    #[tokio::test]
    async fn stream_waits_for_new_messages() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscriber("g").subscribe("t").await.unwrap();

        let pusher = broker.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            pusher.push_raw("t", Some(b"k"), Some(b"late"));
        });

        let message = stream.next().await.unwrap().unwrap();
        assert_eq!(message.payload.as_deref(), Some(b"late".as_slice()));
        assert_eq!(message.key.as_deref(), Some(b"k".as_slice()));
    }

    #[tokio::test]
    async fn refused_connections_recover() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connections(1);

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.live_connections(), 1);
    }
}
