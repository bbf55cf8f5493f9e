use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::BrokerPtr;
use crate::client::RpcClient;
use crate::config::BridgeConfig;
use crate::correlation::CorrelationRegistry;
use crate::errors::Result;
use crate::health::{ConnectionState, HealthMonitor};
use crate::listener::ResponseListener;
use crate::topology::TopologyManager;

/// Interval of the registry sweep run next to the response listener.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Caller side of the bridge: the declared topology, a running response
/// listener and the client that sends through them.
pub struct Gateway {
    broker: BrokerPtr,
    client: RpcClient,
    listeners: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Declares the topology (retrying while the broker is unreachable),
    /// starts the response listener and returns once calls can be made.
    pub async fn start(broker: BrokerPtr, config: &BridgeConfig) -> Result<Self> {
        broker.health().set(ConnectionState::Initializing);

        let declared = TopologyManager::new(broker.as_ref(), &config.topology)
            .with_policy(config.reconnect.clone())
            .declare()
            .await;
        if let Err(e) = declared {
            broker.health().set(ConnectionState::Failed);
            return Err(e);
        }

        let registry = Arc::new(CorrelationRegistry::new());
        let listeners = ResponseListener::new(broker.clone(), registry.clone())
            .with_policy(config.reconnect.clone())
            .with_prefetch(config.worker.prefetch_count)
            .with_sweep(SWEEP_INTERVAL)
            .spawn(&config.topology);

        let client = RpcClient::new(
            broker.clone(),
            registry,
            &config.topology.exchange,
            config.rpc_timeout(),
        );

        info!(
            exchange = %config.topology.exchange,
            response_queues = config.topology.response_queues().count(),
            timeout_ms = config.rpc.timeout_ms,
            "Gateway ready"
        );
        Ok(Self {
            broker,
            client,
            listeners,
        })
    }

    /// A handle for making calls. Clones share the registry.
    pub fn client(&self) -> RpcClient {
        self.client.clone()
    }

    pub fn health(&self) -> &HealthMonitor {
        self.broker.health()
    }

    /// Stops the listener and closes the broker connection. Calls still in
    /// flight time out.
    pub async fn shutdown(self) -> Result<()> {
        for handle in &self.listeners {
            handle.abort();
        }
        if self.client.pending_calls() > 0 {
            warn!(pending = self.client.pending_calls(), "Shutting down with calls in flight");
        }
        self.broker.close().await
    }
}
