// src/main.rs
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rabbit_bridge::config::{create_default_config_file, CONFIG_FILE_NAME};
use rabbit_bridge::env::load_bridge_config;
use rabbit_bridge::services::{post, user};
use rabbit_bridge::{
    BridgeConfig, BrokerPtr, Gateway, MemoryBroker, RabbitBroker, Service, TopologyManager,
};

fn usage() {
    println!("Usage: rabbit_bridge <command>");
    println!();
    println!("  declare                      declare exchange, queues and bindings");
    println!("  worker <user|post|image>     run a service worker (in-memory backend)");
    println!("  gateway <routing_key> [json] send one request and print the response");
    println!("  demo                         run gateway and workers on an in-memory broker");
    println!("  init-config [path]           write a default {}", CONFIG_FILE_NAME);
}

fn rabbit_broker(config: &BridgeConfig) -> BrokerPtr {
    Arc::new(RabbitBroker::from_config(config))
}

async fn run_declare(config: &BridgeConfig) -> Result<()> {
    let broker = rabbit_broker(config);
    TopologyManager::new(broker.as_ref(), &config.topology)
        .with_policy(config.reconnect.clone())
        .declare()
        .await?;
    broker.close().await?;
    Ok(())
}

async fn run_worker(config: &BridgeConfig, service: Service) -> Result<()> {
    let broker = rabbit_broker(config);
    TopologyManager::new(broker.as_ref(), &config.topology)
        .with_policy(config.reconnect.clone())
        .declare()
        .await?;

    let worker = service
        .demo_worker()
        .dedup_capacity(config.worker.dedup_capacity)
        .reconnect_policy(config.reconnect.clone())
        .build();

    info!(%service, "Worker started. Press Ctrl+C to exit.");
    tokio::select! {
        result = worker.run(broker.clone(), &config.topology.exchange, config.worker.prefetch_count) => {
            result.context("worker stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    broker.close().await?;
    Ok(())
}

async fn run_gateway(config: &BridgeConfig, routing_key: &str, body: Option<&str>) -> Result<()> {
    let payload: Option<Value> = body
        .map(serde_json::from_str)
        .transpose()
        .context("request body is not valid JSON")?;

    let gateway = Gateway::start(rabbit_broker(config), config).await?;
    let result = gateway.client().send(routing_key, payload.as_ref()).await;
    gateway.shutdown().await?;

    let response = result?;
    println!("{}", response);
    Ok(())
}

async fn run_demo(config: &BridgeConfig) -> Result<()> {
    let broker = MemoryBroker::new();
    let broker_ptr: BrokerPtr = Arc::new(broker.clone());

    let gateway = Gateway::start(broker_ptr.clone(), config).await?;
    let workers: Vec<_> = Service::ALL
        .iter()
        .map(|service| {
            service
                .demo_worker()
                .dedup_capacity(config.worker.dedup_capacity)
                .build()
                .spawn(broker_ptr.clone(), &config.topology.exchange, config.worker.prefetch_count)
        })
        .collect();

    let client = gateway.client();
    let steps: Vec<(&str, Value)> = vec![
        (user::REGISTER, json!({"name": "Ada", "email": "a@b.com", "password": "x"})),
        (user::LOGIN, json!({"email": "a@b.com", "password": "x"})),
        (user::GET_ALL, json!({})),
        (post::CREATE, json!({"user_id": 1, "text": "Hello from the bridge"})),
        (post::LIKE, json!({"post_id": 1, "user_id": 1})),
        (post::GET_BY_ID, json!({"id": 1})),
        ("video.encode", json!({})),
    ];

    for (routing_key, body) in &steps {
        match client
            .send_with_timeout(routing_key, Some(body), std::time::Duration::from_secs(2))
            .await
        {
            Ok(response) => println!("{:<16} -> {}", routing_key, response),
            Err(e) => println!("{:<16} !! {}", routing_key, e),
        }
    }

    for worker in workers {
        worker.abort();
    }
    gateway.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str);

    if command == Some("init-config") {
        let path = args
            .get(2)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        return create_default_config_file(&path);
    }

    let config = load_bridge_config()?;

    let result = match command {
        Some("declare") => run_declare(&config).await,
        Some("worker") => {
            let service: Service = args
                .get(2)
                .ok_or_else(|| anyhow!("worker needs a service name"))?
                .parse()
                .map_err(|e: String| anyhow!(e))?;
            run_worker(&config, service).await
        }
        Some("gateway") => {
            let routing_key = args
                .get(2)
                .ok_or_else(|| anyhow!("gateway needs a routing key"))?;
            run_gateway(&config, routing_key, args.get(3).map(String::as_str)).await
        }
        Some("demo") => run_demo(&config).await,
        _ => {
            usage();
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
