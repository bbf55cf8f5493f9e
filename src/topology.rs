use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::backoff::ReconnectPolicy;
use crate::broker::Broker;
use crate::errors::{BridgeError, Result};
use crate::message::response_key;
use crate::services::Service;

/// Name of the single process-wide exchange.
pub const DEFAULT_EXCHANGE: &str = "gateway_exchange";

/// Queues with one of these suffixes carry responses and are consumed only
/// by the response listener.
pub const RESPONSE_QUEUE_SUFFIXES: [&str; 2] = ["_responses", "-responses"];

pub fn is_response_queue(queue: &str) -> bool {
    RESPONSE_QUEUE_SUFFIXES
        .iter()
        .any(|suffix| queue.ends_with(suffix))
}

/// Exchange name plus queue name -> ordered routing keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, Vec<String>>,
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_string()
}

fn default_queues() -> BTreeMap<String, Vec<String>> {
    let mut queues = BTreeMap::new();
    for service in Service::ALL {
        let keys = service.routing_keys();
        queues.insert(
            service.queue().to_string(),
            keys.iter().map(|k| k.to_string()).collect(),
        );
        queues.insert(
            service.response_queue().to_string(),
            keys.iter().map(|k| response_key(k)).collect(),
        );
    }
    queues
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            queues: default_queues(),
        }
    }
}

impl TopologyConfig {
    pub fn response_queues(&self) -> impl Iterator<Item = &str> {
        self.queues
            .keys()
            .map(String::as_str)
            .filter(|q| is_response_queue(q))
    }

    pub fn request_queues(&self) -> impl Iterator<Item = &str> {
        self.queues
            .keys()
            .map(String::as_str)
            .filter(|q| !is_response_queue(q))
    }

    pub fn routing_keys(&self, queue: &str) -> &[String] {
        self.queues.get(queue).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Queue a routing key is bound to, if any.
    pub fn queue_for(&self, routing_key: &str) -> Option<&str> {
        self.queues
            .iter()
            .find(|(_, keys)| keys.iter().any(|k| k == routing_key))
            .map(|(queue, _)| queue.as_str())
    }

    /// Rejects empty names and routing keys bound to more than one queue.
    pub fn validate(&self) -> Result<()> {
        if self.exchange.trim().is_empty() {
            return Err(BridgeError::TopologyError("exchange name cannot be empty".to_string()));
        }

        let mut owners: HashMap<&str, &str> = HashMap::new();
        for (queue, keys) in &self.queues {
            if queue.trim().is_empty() {
                return Err(BridgeError::TopologyError("queue name cannot be empty".to_string()));
            }
            for key in keys {
                if key.trim().is_empty() {
                    return Err(BridgeError::TopologyError(format!(
                        "queue '{}' has an empty routing key",
                        queue
                    )));
                }
                if let Some(other) = owners.insert(key.as_str(), queue.as_str()) {
                    if other != queue {
                        return Err(BridgeError::TopologyError(format!(
                            "routing key '{}' is bound to both '{}' and '{}'",
                            key, other, queue
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Declares the exchange, every queue and every binding of a
/// [`TopologyConfig`]. Safe to run any number of times.
pub struct TopologyManager<'a> {
    broker: &'a dyn Broker,
    config: &'a TopologyConfig,
    policy: ReconnectPolicy,
}

impl<'a> TopologyManager<'a> {
    pub fn new(broker: &'a dyn Broker, config: &'a TopologyConfig) -> Self {
        Self {
            broker,
            config,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Declares the topology, retrying the whole sequence with backoff while
    /// the broker is unreachable.
    pub async fn declare(&self) -> Result<()> {
        self.config.validate()?;
        self.policy
            .retry("declare topology", || self.declare_once())
            .await?;

        info!(
            exchange = %self.config.exchange,
            queues = self.config.queues.len(),
            "Topology declared"
        );
        Ok(())
    }

    async fn declare_once(&self) -> Result<()> {
        self.broker.reconnect().await?;
        self.broker.declare_exchange(&self.config.exchange).await?;

        for (queue, keys) in &self.config.queues {
            self.broker.declare_queue(queue).await?;
            for key in keys {
                self.broker
                    .bind_queue(queue, &self.config.exchange, key)
                    .await?;
                debug!(queue = %queue, routing_key = %key, "Bound");
            }
        }
        Ok(())
    }
}
