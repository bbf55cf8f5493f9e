use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle of a process' broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connect-and-declare phase; no traffic accepted yet.
    Initializing,
    Connected,
    /// Connection lost, supervised reconnect in progress.
    Reconnecting,
    /// Reconnect attempts exhausted.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Health signal shared by a broker and everything running on it.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Initializing);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn set(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            match state {
                ConnectionState::Reconnecting | ConnectionState::Failed => {
                    warn!(from = %previous, to = %state, "Broker connection state changed")
                }
                _ => info!(from = %previous, to = %state, "Broker connection state changed"),
            }
        }
    }

    /// Waits until the connection reports `Connected`, or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let wait = rx.wait_for(|state| *state == ConnectionState::Connected);
        let connected = matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)));
        connected
    }
}
