// src/env.rs
// Environment overrides for BridgeConfig. A .env file is honoured through dotenv.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use tracing::debug;

use crate::config::BridgeConfig;

pub const AMQP_ADDR: &str = "AMQP_ADDR";
pub const PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const CONNECT_TIMEOUT_SECONDS: &str = "RABBITMQ_CONNECT_TIMEOUT_SECONDS";
pub const RPC_TIMEOUT_MS: &str = "RPC_TIMEOUT_MS";
pub const EXCHANGE: &str = "BRIDGE_EXCHANGE";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub amqp_addr: Option<String>,
    pub prefetch_count: Option<u16>,
    pub connect_timeout_seconds: Option<u64>,
    pub rpc_timeout_ms: Option<u64>,
    pub exchange: Option<String>,
}

fn parse<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("{} has an invalid value: {:?}", name, raw))
        })
        .transpose()
}

impl EnvOverrides {
    /// Reads the process environment, after loading `.env` if present.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Ok(Self {
            amqp_addr: non_empty(AMQP_ADDR),
            prefetch_count: parse(PREFETCH_COUNT, non_empty(PREFETCH_COUNT))?,
            connect_timeout_seconds: parse(CONNECT_TIMEOUT_SECONDS, non_empty(CONNECT_TIMEOUT_SECONDS))?,
            rpc_timeout_ms: parse(RPC_TIMEOUT_MS, non_empty(RPC_TIMEOUT_MS))?,
            exchange: non_empty(EXCHANGE),
        })
    }

    pub fn apply(&self, config: &mut BridgeConfig) {
        if let Some(uri) = &self.amqp_addr {
            debug!("{} overrides connection.uri", AMQP_ADDR);
            config.connection.uri = uri.clone();
        }
        if let Some(prefetch) = self.prefetch_count {
            config.worker.prefetch_count = prefetch;
        }
        if let Some(seconds) = self.connect_timeout_seconds {
            config.connection.connection_timeout_ms = seconds.saturating_mul(1000);
        }
        if let Some(timeout) = self.rpc_timeout_ms {
            config.rpc.timeout_ms = timeout;
        }
        if let Some(exchange) = &self.exchange {
            config.topology.exchange = exchange.clone();
        }
    }
}

/// Config file (or defaults) with environment overrides applied, validated.
pub fn load_bridge_config() -> Result<BridgeConfig> {
    let mut config = crate::config::load_or_default()?;
    EnvOverrides::load()?.apply(&mut config);
    config.validate()?;
    Ok(config)
}
