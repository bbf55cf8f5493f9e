use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::backoff::ReconnectPolicy;
use crate::broker::{BrokerPtr, Delivery, DeliveryStream};
use crate::errors::Result;
use crate::health::ConnectionState;

/// Consumes one queue for as long as the process runs, re-subscribing after
/// the broker connection is lost. Each delivery is handled on its own task;
/// the prefetch limit bounds how many run at once.
pub struct SupervisedConsumer {
    broker: BrokerPtr,
    queue: String,
    prefetch: u16,
    policy: ReconnectPolicy,
}

impl SupervisedConsumer {
    pub fn new(broker: BrokerPtr, queue: &str, prefetch: u16) -> Self {
        Self {
            broker,
            queue: queue.to_string(),
            prefetch,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn subscribe(&self) -> Result<DeliveryStream> {
        let what = format!("consume '{}'", self.queue);
        let result = self
            .policy
            .retry(&what, || async {
                self.broker.reconnect().await?;
                self.broker.consume(&self.queue, self.prefetch).await
            })
            .await;

        if result.is_err() {
            self.broker.health().set(ConnectionState::Failed);
        }
        result
    }

    /// Runs until reconnecting fails for good, then returns that error.
    pub async fn run<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let mut stream = self.subscribe().await?;
            info!(queue = %self.queue, prefetch = self.prefetch, "Consumer running");

            while let Some(delivery) = stream.next().await {
                let handler = handler.clone();
                tokio::spawn(async move { handler(delivery).await });
            }

            warn!(queue = %self.queue, "Delivery stream ended, reconnecting");
            if self.broker.health().state() == ConnectionState::Connected {
                self.broker.health().set(ConnectionState::Reconnecting);
            }
            sleep(Duration::from_millis(self.policy.initial_delay_ms)).await;
        }
    }
}
