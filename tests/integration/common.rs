use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use rabbit_bridge::{
    BridgeConfig, BrokerPtr, Gateway, MemoryBroker, ReconnectPolicy, RpcClient, Service, Worker,
};

pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.reconnect = ReconnectPolicy {
        max_attempts: 100,
        initial_delay_ms: 5,
        max_delay_ms: 50,
    };
    config.rpc.timeout_ms = 2000;
    config
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub gateway: Gateway,
    pub client: RpcClient,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn start(workers: Vec<Worker>) -> Self {
        Self::start_with(test_config(), workers).await
    }

    /// Gateway plus the in-memory user, post and image workers.
    pub async fn demo() -> Self {
        let workers = Service::ALL
            .iter()
            .map(|service| {
                service
                    .demo_worker()
                    .reconnect_policy(test_config().reconnect)
                    .build()
            })
            .collect();
        Self::start(workers).await
    }

    pub async fn start_with(config: BridgeConfig, workers: Vec<Worker>) -> Self {
        let broker = MemoryBroker::new();
        let broker_ptr: BrokerPtr = Arc::new(broker.clone());

        let gateway = Gateway::start(broker_ptr.clone(), &config).await.unwrap();
        let workers = workers
            .into_iter()
            .map(|worker| {
                worker.spawn(
                    broker_ptr.clone(),
                    &config.topology.exchange,
                    config.worker.prefetch_count,
                )
            })
            .collect();
        let client = gateway.client();

        Self {
            broker,
            gateway,
            client,
            workers,
        }
    }

    pub async fn shutdown(self) {
        for worker in &self.workers {
            worker.abort();
        }
        self.gateway.shutdown().await.unwrap();
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
