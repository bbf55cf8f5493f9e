use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backoff::ReconnectPolicy;
use crate::broker::{BrokerPtr, Delivery};
use crate::consumer::SupervisedConsumer;
use crate::correlation::{CorrelationRegistry, Resolution};
use crate::topology::TopologyConfig;

/// Consumes the response queues and hands each response to the call that is
/// waiting for it.
pub struct ResponseListener {
    broker: BrokerPtr,
    registry: Arc<CorrelationRegistry>,
    policy: ReconnectPolicy,
    prefetch: u16,
    sweep_interval: Option<Duration>,
}

impl ResponseListener {
    pub fn new(broker: BrokerPtr, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            broker,
            registry,
            policy: ReconnectPolicy::default(),
            prefetch: 0,
            sweep_interval: None,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Also drops registry entries whose deadline passed, every `interval`.
    /// Calls time out on their own; the sweep only catches callers that
    /// stopped polling.
    pub fn with_sweep(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Starts one supervised consumer per response queue of `topology`.
    pub fn spawn(self, topology: &TopologyConfig) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for queue in topology.response_queues() {
            let consumer = SupervisedConsumer::new(self.broker.clone(), queue, self.prefetch)
                .with_policy(self.policy.clone());
            let registry = self.registry.clone();
            let queue = queue.to_string();

            handles.push(tokio::spawn(async move {
                let result = consumer
                    .run(move |delivery| {
                        let registry = registry.clone();
                        async move { handle_response(&registry, delivery).await }
                    })
                    .await;
                if let Err(e) = result {
                    error!(queue = %queue, "Response listener stopped: {}", e);
                }
            }));
        }

        if let Some(interval) = self.sweep_interval {
            let registry = self.registry.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let swept = registry.expire_overdue(Instant::now());
                    if !swept.is_empty() {
                        debug!(count = swept.len(), "Swept overdue calls");
                    }
                }
            }));
        }

        handles
    }
}

/// Resolves the waiting call, if any, then acks. Responses nobody waits for
/// are dropped after a warning.
pub async fn handle_response(registry: &CorrelationRegistry, delivery: Delivery) {
    let envelope = &delivery.envelope;

    match envelope.correlation_id {
        Some(id) => match registry.resolve(&id, envelope.payload.clone()) {
            Resolution::Delivered => {}
            Resolution::Abandoned => {
                debug!(correlation_id = %id, routing_key = %envelope.routing_key, "Caller gone before response arrived");
            }
            Resolution::Miss => {
                warn!(
                    correlation_id = %id,
                    routing_key = %envelope.routing_key,
                    "Correlation miss: no pending call for response"
                );
            }
        },
        None => {
            warn!(
                routing_key = %envelope.routing_key,
                "Correlation miss: response carries no correlation id"
            );
        }
    }

    if let Err(e) = delivery.ack().await {
        warn!(routing_key = %envelope.routing_key, "Failed to ack response: {}", e);
    }
}
