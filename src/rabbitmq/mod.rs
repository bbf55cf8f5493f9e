// src/rabbitmq/mod.rs
// RabbitMQ implementation of the broker seam

mod broker;
mod channel_manager;
mod connection;

pub use broker::RabbitBroker;
pub use channel_manager::{properties_for, ChannelConfig, ChannelManager};
pub use connection::ConnectionManager;
