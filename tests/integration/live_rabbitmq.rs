use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use rabbit_bridge::config::load_config_from;
use rabbit_bridge::env::EnvOverrides;
use rabbit_bridge::worker::typed;
use rabbit_bridge::{BridgeConfig, BrokerPtr, Gateway, RabbitBroker, Reply, WorkerBuilder};

fn load_test_config() -> BridgeConfig {
    let mut config = load_config_from(Path::new("tests/fixtures/rabbit_bridge.json"))
        .expect("Failed to load test config");
    EnvOverrides::load()
        .expect("Invalid environment overrides")
        .apply(&mut config);
    config
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance (AMQP_ADDR or tests/fixtures config)
async fn test_round_trip_against_rabbitmq() {
    let config = load_test_config();
    let broker: BrokerPtr = Arc::new(RabbitBroker::from_config(&config));

    let gateway = Gateway::start(broker.clone(), &config).await.unwrap();
    let echo = WorkerBuilder::new("it", "it_service")
        .route(
            "it.echo",
            typed("Echo request was null.", |body: Value| async move {
                Ok(Reply::Data(body))
            }),
        )
        .build()
        .spawn(broker.clone(), &config.topology.exchange, config.worker.prefetch_count);

    let client = gateway.client();
    let mut calls = Vec::new();
    for i in 0..5 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.send("it.echo", Some(&json!({"n": i}))).await
        }));
    }
    for (i, call) in calls.into_iter().enumerate() {
        let response: Value = serde_json::from_str(&call.await.unwrap().unwrap()).unwrap();
        assert_eq!(response, json!({"n": i}));
    }

    echo.abort();
    gateway.shutdown().await.unwrap();
}
