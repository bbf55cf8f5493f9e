//! Request/response over a RabbitMQ direct exchange.
//!
//! A [`Gateway`] declares the topology, listens on the response queues and
//! hands out [`RpcClient`]s; each domain service runs a [`Worker`] that
//! answers requests on `response.<routing key>`. Calls are matched to
//! responses by a per-call [`CorrelationId`], never by routing key.

pub mod backoff;
pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod correlation;
pub mod env;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod listener;
pub mod message;
pub mod rabbitmq;
pub mod services;
pub mod topology;
pub mod worker;

pub use backoff::ReconnectPolicy;
pub use broker::{Broker, BrokerPtr, Delivery, MemoryBroker};
pub use client::{RpcClient, RpcError};
pub use config::BridgeConfig;
pub use correlation::CorrelationRegistry;
pub use errors::{BridgeError, Result};
pub use gateway::Gateway;
pub use health::{ConnectionState, HealthMonitor};
pub use message::{CorrelationId, Envelope, Reply, StatusReply};
pub use rabbitmq::RabbitBroker;
pub use services::Service;
pub use topology::{TopologyConfig, TopologyManager};
pub use worker::{HandlerError, RequestHandler, Worker, WorkerBuilder};
