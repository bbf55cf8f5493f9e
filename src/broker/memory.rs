// src/broker/memory.rs
// In-process broker with direct-exchange routing. Used by tests and the demo binary.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use super::{Acknowledger, Broker, Delivery, DeliveryStream};
use crate::errors::{BridgeError, Result};
use crate::health::{ConnectionState, HealthMonitor};
use crate::message::Envelope;

/// Counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub published: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub nacked: u64,
}

struct ConsumerSlot {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    credit: Arc<Semaphore>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(Envelope, bool)>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    stats: QueueStats,
}

struct State {
    available: bool,
    exchanges: BTreeSet<String>,
    queues: BTreeMap<String, QueueState>,
    // exchange -> routing key -> queues
    bindings: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    failing_publishes: usize,
    next_consumer_id: u64,
}

struct Inner {
    state: Mutex<State>,
    health: HealthMonitor,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves counters consistent enough for tests
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reference implementation of the [`Broker`] contract.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let health = HealthMonitor::new();
        health.set(ConnectionState::Connected);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    available: true,
                    exchanges: BTreeSet::new(),
                    queues: BTreeMap::new(),
                    bindings: BTreeMap::new(),
                    failing_publishes: 0,
                    next_consumer_id: 0,
                }),
                health,
            }),
        }
    }

    pub fn exchange_names(&self) -> Vec<String> {
        self.inner.lock().exchanges.iter().cloned().collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.lock().queues.keys().cloned().collect()
    }

    /// `(routing_key, queue)` pairs bound on `exchange`, sorted.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        let state = self.inner.lock();
        state
            .bindings
            .get(exchange)
            .map(|keys| {
                keys.iter()
                    .flat_map(|(key, queues)| queues.iter().map(move |q| (key.clone(), q.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = self.inner.lock();
        state.queues.get(queue).map(|q| {
            let mut stats = q.stats.clone();
            stats.ready = q.ready.len();
            stats.consumers = q.consumers.iter().filter(|c| !c.tx.is_closed()).count();
            stats
        })
    }

    /// Simulates losing the broker: consumers are cut off, unacknowledged
    /// deliveries return to their queues once dropped, and every operation
    /// fails until [`MemoryBroker::restore`].
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.lock();
            state.available = false;
            for queue in state.queues.values_mut() {
                queue.consumers.clear();
            }
        }
        warn!("Memory broker connection dropped");
        self.inner.health.set(ConnectionState::Reconnecting);
    }

    /// Makes the broker reachable again. Consumers must reconnect.
    pub fn restore(&self) {
        self.inner.lock().available = true;
        debug!("Memory broker reachable again");
    }

    /// Makes the next `count` publishes fail with a publish error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.lock().failing_publishes = count;
    }

    fn ensure_available(state: &State) -> Result<()> {
        if state.available {
            Ok(())
        } else {
            Err(BridgeError::ConnectionError("broker unreachable".to_string()))
        }
    }
}

/// Hands ready messages to consumers with spare credit, round-robin.
/// Returns the sends to perform once the state lock is released.
fn schedule(
    inner: &Arc<Inner>,
    state: &mut State,
    queue_name: &str,
) -> Vec<(mpsc::UnboundedSender<Delivery>, Delivery)> {
    let mut sends = Vec::new();
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return sends;
    };
    queue.consumers.retain(|c| !c.tx.is_closed());

    while !queue.ready.is_empty() && !queue.consumers.is_empty() {
        let count = queue.consumers.len();
        let mut chosen = None;
        for offset in 0..count {
            let index = (queue.next_consumer + offset) % count;
            if let Ok(permit) = queue.consumers[index].credit.clone().try_acquire_owned() {
                chosen = Some((index, permit));
                break;
            }
        }
        let Some((index, permit)) = chosen else {
            break;
        };
        queue.next_consumer = (index + 1) % count;

        let Some((envelope, redelivered)) = queue.ready.pop_front() else {
            break;
        };
        queue.stats.unacked += 1;
        queue.stats.delivered += 1;
        if redelivered {
            queue.stats.redelivered += 1;
        }

        let slot = &queue.consumers[index];
        trace!(queue = %queue_name, consumer = slot.id, routing_key = %envelope.routing_key, "Delivering");
        let acker = MemoryAcker {
            inner: Arc::downgrade(inner),
            queue: queue_name.to_string(),
            envelope: envelope.clone(),
            permit: Mutex::new(Some(permit)),
            settled: AtomicBool::new(false),
        };
        sends.push((
            slot.tx.clone(),
            Delivery::new(envelope, redelivered, Box::new(acker)),
        ));
    }
    sends
}

fn dispatch(sends: Vec<(mpsc::UnboundedSender<Delivery>, Delivery)>) {
    for (tx, delivery) in sends {
        // A closed consumer drops the delivery here, outside the lock, and its
        // acker puts the message back on the queue.
        let _ = tx.send(delivery);
    }
}

fn pump(inner: &Arc<Inner>, queue_name: &str) {
    let sends = {
        let mut state = inner.lock();
        schedule(inner, &mut state, queue_name)
    };
    dispatch(sends);
}

struct MemoryAcker {
    inner: Weak<Inner>,
    queue: String,
    envelope: Envelope,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn release_credit(&self) {
        if let Ok(mut permit) = self.permit.lock() {
            permit.take();
        }
    }

    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(BridgeError::ChannelError("broker dropped".to_string()));
        };

        {
            let mut state = inner.lock();
            MemoryBroker::ensure_available(&state)?;
            if self.settled.swap(true, Ordering::SeqCst) {
                return Err(BridgeError::AckError(format!(
                    "delivery on '{}' already settled",
                    self.queue
                )));
            }
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.stats.unacked = queue.stats.unacked.saturating_sub(1);
                match requeue {
                    None => queue.stats.acked += 1,
                    Some(requeue) => {
                        queue.stats.nacked += 1;
                        if requeue {
                            queue.ready.push_front((self.envelope.clone(), true));
                        }
                    }
                }
            }
        }

        self.release_credit();
        pump(&inner, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if self.settled.load(Ordering::SeqCst) {
            return;
        }
        self.release_credit();
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut state = inner.lock();
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.stats.unacked = queue.stats.unacked.saturating_sub(1);
                queue.ready.push_front((self.envelope.clone(), true));
            }
        }
        debug!(queue = %self.queue, "Unacknowledged delivery returned to queue");
        pump(&inner, &self.queue);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let mut state = self.inner.lock();
        Self::ensure_available(&state)?;
        if state.exchanges.insert(exchange.to_string()) {
            debug!(exchange, "Declared exchange");
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.inner.lock();
        Self::ensure_available(&state)?;
        if !state.queues.contains_key(queue) {
            state.queues.insert(queue.to_string(), QueueState::default());
            debug!(queue, "Declared queue");
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.inner.lock();
        Self::ensure_available(&state)?;
        if !state.exchanges.contains(exchange) {
            return Err(BridgeError::TopologyError(format!("no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BridgeError::TopologyError(format!("no queue '{}'", queue)));
        }
        state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .entry(routing_key.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        let (targets, sends) = {
            let mut state = self.inner.lock();
            Self::ensure_available(&state)?;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(BridgeError::PublishError("injected publish failure".to_string()));
            }
            if !state.exchanges.contains(exchange) {
                return Err(BridgeError::ChannelError(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }

            let targets: Vec<String> = state
                .bindings
                .get(exchange)
                .and_then(|keys| keys.get(&envelope.routing_key))
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default();

            let mut sends = Vec::new();
            for name in &targets {
                if let Some(queue) = state.queues.get_mut(name) {
                    queue.ready.push_back((envelope.clone(), false));
                    queue.stats.published += 1;
                }
                sends.extend(schedule(&self.inner, &mut state, name));
            }
            (targets, sends)
        };

        if targets.is_empty() {
            debug!(routing_key = %envelope.routing_key, "Unroutable message dropped");
        }
        dispatch(sends);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock();
            Self::ensure_available(&state)?;
            let id = state.next_consumer_id;
            state.next_consumer_id += 1;
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Err(BridgeError::ConsumeError(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            };
            let permits = if prefetch == 0 {
                Semaphore::MAX_PERMITS
            } else {
                prefetch as usize
            };
            queue_state.consumers.push(ConsumerSlot {
                id,
                tx,
                credit: Arc::new(Semaphore::new(permits)),
            });
            debug!(queue, consumer = id, prefetch, "Consumer registered");
        }
        pump(&self.inner, queue);
        Ok(DeliveryStream::new(rx))
    }

    async fn reconnect(&self) -> Result<()> {
        let state = self.inner.lock();
        Self::ensure_available(&state)?;
        drop(state);
        self.inner.health.set(ConnectionState::Connected);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        Ok(())
    }

    fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CorrelationId;
    use std::time::Duration;

    async fn broker_with_queue(queue: &str, keys: &[&str]) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_exchange("ex").await.unwrap();
        broker.declare_queue(queue).await.unwrap();
        for key in keys {
            broker.bind_queue(queue, "ex", key).await.unwrap();
        }
        broker
    }

    fn request(key: &str) -> Envelope {
        Envelope::request(key, b"{}".to_vec(), CorrelationId::new())
    }

    #[tokio::test]
    async fn test_direct_routing_by_key() {
        let broker = broker_with_queue("users", &["user.login"]).await;
        broker.declare_queue("posts").await.unwrap();
        broker.bind_queue("posts", "ex", "post.like").await.unwrap();

        broker.publish("ex", &request("user.login")).await.unwrap();
        broker.publish("ex", &request("post.like")).await.unwrap();
        broker.publish("ex", &request("image.process")).await.unwrap();

        assert_eq!(broker.queue_stats("users").unwrap().ready, 1);
        assert_eq!(broker.queue_stats("posts").unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_redeclaring_is_idempotent() {
        let broker = broker_with_queue("users", &["user.login", "user.login"]).await;
        broker.declare_exchange("ex").await.unwrap();
        broker.declare_queue("users").await.unwrap();
        broker.bind_queue("users", "ex", "user.login").await.unwrap();

        assert_eq!(broker.exchange_names(), vec!["ex"]);
        assert_eq!(broker.queue_names(), vec!["users"]);
        assert_eq!(
            broker.bindings("ex"),
            vec![("user.login".to_string(), "users".to_string())]
        );
    }

    #[tokio::test]
    async fn test_prefetch_limits_outstanding_deliveries() {
        let broker = broker_with_queue("q", &["k"]).await;
        for _ in 0..3 {
            broker.publish("ex", &request("k")).await.unwrap();
        }

        let mut stream = broker.consume("q", 1).await.unwrap();
        let first = stream.next().await.unwrap();
        let stats = broker.queue_stats("q").unwrap();
        assert_eq!((stats.unacked, stats.ready), (1, 2));

        first.ack().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        second.ack().await.unwrap();

        let stats = broker.queue_stats("q").unwrap();
        assert_eq!(stats.acked, 2);
        assert_eq!(stats.unacked, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = broker_with_queue("q", &["k"]).await;
        broker.publish("ex", &request("k")).await.unwrap();
        let mut stream = broker.consume("q", 0).await.unwrap();
        let delivery = stream.next().await.unwrap();

        delivery.ack().await.unwrap();
        assert!(matches!(delivery.ack().await, Err(BridgeError::AckError(_))));
        assert_eq!(broker.queue_stats("q").unwrap().acked, 1);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let broker = broker_with_queue("q", &["k"]).await;
        broker.publish("ex", &request("k")).await.unwrap();
        let mut stream = broker.consume("q", 1).await.unwrap();

        let delivery = stream.next().await.unwrap();
        assert!(!delivery.redelivered);
        drop(delivery);

        let again = stream.next().await.unwrap();
        assert!(again.redelivered);
        again.ack().await.unwrap();
        assert_eq!(broker.queue_stats("q").unwrap().redelivered, 1);
    }

    #[tokio::test]
    async fn test_nack_with_requeue() {
        let broker = broker_with_queue("q", &["k"]).await;
        broker.publish("ex", &request("k")).await.unwrap();
        let mut stream = broker.consume("q", 1).await.unwrap();

        stream.next().await.unwrap().nack(true).await.unwrap();
        let again = stream.next().await.unwrap();
        assert!(again.redelivered);
        again.nack(false).await.unwrap();

        let stats = broker.queue_stats("q").unwrap();
        assert_eq!((stats.nacked, stats.ready, stats.unacked), (2, 0, 0));
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams_and_fails_operations() {
        let broker = broker_with_queue("q", &["k"]).await;
        let mut stream = broker.consume("q", 1).await.unwrap();

        broker.disconnect();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.health().state(), ConnectionState::Reconnecting);
        assert!(broker.publish("ex", &request("k")).await.is_err());
        assert!(broker.reconnect().await.is_err());

        broker.restore();
        broker.reconnect().await.unwrap();
        assert!(broker.health().is_healthy());
        broker.publish("ex", &request("k")).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = MemoryBroker::new();
        let err = broker.publish("nope", &request("k")).await.unwrap_err();
        assert!(matches!(err, BridgeError::ChannelError(_)));
    }
}
