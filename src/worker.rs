use async_trait::async_trait;
use futures::FutureExt;
use serde::de::{DeserializeOwned, IgnoredAny};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::broker::{Broker, BrokerPtr, Delivery};
use crate::consumer::SupervisedConsumer;
use crate::errors::Result;
use crate::message::{Envelope, Reply};

/// Reply for routing keys the worker has no handler for.
pub const UNHANDLED_REQUEST: &str = "Unhandled request.";

/// Reply when a handler panics.
pub const INTERNAL_FAILURE: &str = "Request could not be processed.";

pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Why a handler could not produce a normal reply. Always turned into a
/// `{success: false}` envelope; never reaches the broker layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Payload missing, malformed or failing shape validation.
    #[error("{0}")]
    InvalidRequest(String),

    /// The backend refused the request (unknown id, duplicate email, ...).
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Backend(String),
}

impl HandlerError {
    pub fn into_reply(self) -> Reply {
        Reply::failure(self.to_string())
    }
}

/// Handles the raw body of one request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> std::result::Result<Reply, HandlerError>;
}

/// Body shape expected for a routing key.
pub trait RequestShape: DeserializeOwned + Send + 'static {
    /// Checks beyond what deserialization enforces.
    fn validate(&self) -> bool {
        true
    }
}

/// For keys whose payload is ignored.
impl RequestShape for IgnoredAny {}

impl RequestShape for serde_json::Value {}

/// Decodes the body into `Req` before calling the handler. Bodies that do
/// not decode or validate are answered with `invalid_message`.
pub struct TypedHandler<Req, F> {
    invalid_message: String,
    handler: F,
    _request: PhantomData<fn() -> Req>,
}

pub fn typed<Req, F, Fut>(invalid_message: &str, handler: F) -> TypedHandler<Req, F>
where
    Req: RequestShape,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Reply, HandlerError>> + Send,
{
    TypedHandler {
        invalid_message: invalid_message.to_string(),
        handler,
        _request: PhantomData,
    }
}

#[async_trait]
impl<Req, F, Fut> RequestHandler for TypedHandler<Req, F>
where
    Req: RequestShape,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Reply, HandlerError>> + Send,
{
    async fn handle(&self, payload: &[u8]) -> std::result::Result<Reply, HandlerError> {
        let request: Req = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Request body did not decode: {}", e);
                return Err(HandlerError::InvalidRequest(self.invalid_message.clone()));
            }
        };
        if !request.validate() {
            return Err(HandlerError::InvalidRequest(self.invalid_message.clone()));
        }
        (self.handler)(request).await
    }
}

/// Where a delivery ended up.
///
/// `Received -> Dispatched -> (Handled | FailureEnvelope) -> Published ->
/// Acknowledged`. A delivery whose response could not be published is
/// `Requeued` instead so the broker retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStage {
    Received,
    Dispatched,
    Handled,
    FailureEnvelope,
    Published,
    Acknowledged,
    Requeued,
}

/// How the handler answered a request, and the response bytes it produced.
pub type Answer = (DeliveryStage, Vec<u8>);

/// The path one delivery took through the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// `Handled` or `FailureEnvelope`.
    pub outcome: DeliveryStage,
    /// `Acknowledged` on success, `Requeued` when the response could not be
    /// published, `Published` when only the ack failed.
    pub stage: DeliveryStage,
    /// Answered from the dedup cache without running the handler.
    pub duplicate: bool,
}

/// Responses of recently seen requests, by message id. Oldest entries are
/// evicted first.
///
/// Each entry is a cell the first delivery fills in; a duplicate that
/// arrives while the first is still being handled waits on the same cell
/// instead of running the handler again.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    order: VecDeque<String>,
    slots: HashMap<String, Arc<OnceCell<Answer>>>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            slots: HashMap::new(),
        }
    }

    /// The response recorded for `message_id`, if it has been answered.
    pub fn get(&self, message_id: &str) -> Option<Vec<u8>> {
        self.slots
            .get(message_id)
            .and_then(|slot| slot.get().map(|(_, response)| response.clone()))
    }

    /// The slot for `message_id`, created on first sight.
    pub fn slot(&mut self, message_id: &str) -> Arc<OnceCell<Answer>> {
        if let Some(slot) = self.slots.get(message_id) {
            return slot.clone();
        }
        let slot = Arc::new(OnceCell::new());
        if self.capacity == 0 {
            return slot;
        }
        self.slots.insert(message_id.to_string(), slot.clone());
        self.order.push_back(message_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.slots.remove(&oldest);
            }
        }
        slot
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub struct WorkerBuilder {
    service: String,
    queue: String,
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
    dedup_capacity: usize,
    policy: ReconnectPolicy,
}

impl WorkerBuilder {
    pub fn new(service: &str, queue: &str) -> Self {
        Self {
            service: service.to_string(),
            queue: queue.to_string(),
            handlers: HashMap::new(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn route<H>(mut self, routing_key: &str, handler: H) -> Self
    where
        H: RequestHandler + 'static,
    {
        self.handlers.insert(routing_key.to_string(), Arc::new(handler));
        self
    }

    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Worker {
        Worker {
            inner: Arc::new(WorkerInner {
                service: self.service,
                queue: self.queue,
                handlers: self.handlers,
                dedup: Mutex::new(DedupCache::new(self.dedup_capacity)),
                policy: self.policy,
            }),
        }
    }
}

struct WorkerInner {
    service: String,
    queue: String,
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
    dedup: Mutex<DedupCache>,
    policy: ReconnectPolicy,
}

/// Consumes one service queue and answers every request on
/// `response.<routing key>`.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn routing_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.inner.handlers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    fn dedup_slot(&self, message_id: &str) -> Arc<OnceCell<Answer>> {
        let mut cache = self.inner.dedup.lock().unwrap_or_else(|p| p.into_inner());
        cache.slot(message_id)
    }

    /// Runs the handler for `routing_key`. Unknown keys, handler errors and
    /// panics all come back as failure replies.
    pub async fn dispatch(&self, routing_key: &str, payload: &[u8]) -> Reply {
        let Some(handler) = self.inner.handlers.get(routing_key).cloned() else {
            return Reply::failure(UNHANDLED_REQUEST);
        };

        match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => e.into_reply(),
            Err(_) => {
                error!(service = %self.inner.service, routing_key, "Handler panicked");
                Reply::failure(INTERNAL_FAILURE)
            }
        }
    }

    async fn handle(&self, request: &Envelope) -> Answer {
        let routing_key = request.routing_key.as_str();
        debug!(routing_key, stage = ?DeliveryStage::Dispatched, "Dispatching");

        let reply = self.dispatch(routing_key, &request.payload).await;
        let stage = if reply.is_failure() {
            warn!(
                service = %self.inner.service,
                routing_key,
                reply = %String::from_utf8_lossy(&reply.to_bytes()),
                "Failure envelope"
            );
            DeliveryStage::FailureEnvelope
        } else {
            DeliveryStage::Handled
        };
        debug!(routing_key, ?stage, "Handled");
        (stage, reply.to_bytes())
    }

    /// Takes one delivery through to acknowledgement and reports the path it
    /// took.
    pub async fn process_delivery(
        &self,
        broker: &dyn Broker,
        exchange: &str,
        delivery: Delivery,
    ) -> DeliveryReport {
        let request = &delivery.envelope;
        let routing_key = request.routing_key.as_str();
        debug!(service = %self.inner.service, routing_key, redelivered = delivery.redelivered, stage = ?DeliveryStage::Received, "Delivery");

        let mut handled = false;
        let (outcome, response) = match request.message_id.as_deref() {
            Some(message_id) => {
                let slot = self.dedup_slot(message_id);
                let ran = &mut handled;
                let answer = slot
                    .get_or_init(move || async move {
                        *ran = true;
                        self.handle(request).await
                    })
                    .await
                    .clone();
                if !handled {
                    info!(routing_key, message_id, "Duplicate request, republishing recorded response");
                }
                answer
            }
            None => {
                handled = true;
                self.handle(request).await
            }
        };
        let mut report = DeliveryReport {
            outcome,
            stage: outcome,
            duplicate: !handled,
        };

        let envelope = Envelope::response_to(request, response);
        if let Err(e) = broker.publish(exchange, &envelope).await {
            error!(routing_key, response_key = %envelope.routing_key, "Failed to publish response: {}", e);
            if let Err(e) = delivery.nack(true).await {
                error!(routing_key, "Failed to requeue delivery: {}", e);
            }
            report.stage = DeliveryStage::Requeued;
            return report;
        }
        report.stage = DeliveryStage::Published;

        match delivery.ack().await {
            Ok(()) => {
                report.stage = DeliveryStage::Acknowledged;
                debug!(routing_key, ?report, "Delivery complete");
            }
            Err(e) => error!(routing_key, "Failed to ack delivery: {}", e),
        }
        report
    }

    /// Consumes the worker's queue until reconnecting fails for good.
    pub async fn run(&self, broker: BrokerPtr, exchange: &str, prefetch: u16) -> Result<()> {
        info!(
            service = %self.inner.service,
            queue = %self.inner.queue,
            keys = ?self.routing_keys(),
            "Worker starting"
        );

        let consumer = SupervisedConsumer::new(broker.clone(), &self.inner.queue, prefetch)
            .with_policy(self.inner.policy.clone());
        let worker = self.clone();
        let exchange = exchange.to_string();

        consumer
            .run(move |delivery| {
                let worker = worker.clone();
                let broker = broker.clone();
                let exchange = exchange.clone();
                async move {
                    worker
                        .process_delivery(broker.as_ref(), &exchange, delivery)
                        .await;
                }
            })
            .await
    }

    pub fn spawn(self, broker: BrokerPtr, exchange: &str, prefetch: u16) -> JoinHandle<()> {
        let exchange = exchange.to_string();
        tokio::spawn(async move {
            if let Err(e) = self.run(broker, &exchange, prefetch).await {
                error!(service = %self.inner.service, "Worker stopped: {}", e);
            }
        })
    }
}
