// src/broker/mod.rs
// Transport seam: everything above this module talks to a `Broker`, never to lapin directly.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::health::HealthMonitor;
use crate::message::Envelope;

pub use memory::MemoryBroker;

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement; `requeue` puts the message back on its queue.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub envelope: Envelope,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Deliveries for one consumer. Ends when the consumer is cancelled or the
/// connection underneath it is lost.
pub struct DeliveryStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// A message broker with a direct exchange model.
///
/// Implementations must make `declare_*` and `bind_queue` idempotent and
/// must serialize `publish` calls made through the same connection.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()>;

    /// Starts a consumer. At most `prefetch` deliveries are outstanding
    /// (unacknowledged) at once; 0 means unlimited.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream>;

    /// Re-establishes the connection if it was lost, in a single attempt.
    /// A no-op when healthy.
    async fn reconnect(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn health(&self) -> &HealthMonitor;
}

pub type BrokerPtr = Arc<dyn Broker>;
