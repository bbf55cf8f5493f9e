use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::broker::BrokerPtr;
use crate::correlation::{AlreadyRegistered, CorrelationRegistry};
use crate::errors::BridgeError;
use crate::message::{response_key, CorrelationId, Envelope, EMPTY_PAYLOAD};

/// Failures of the call itself. A domain-level rejection is not an error:
/// it arrives as an ordinary response payload.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no response for '{routing_key}' within {after:?}")]
    Timeout { routing_key: String, after: Duration },

    #[error("transport error: {0}")]
    Transport(#[from] BridgeError),

    #[error("failed to serialize request: {0}")]
    Serialization(serde_json::Error),

    #[error("failed to decode response: {0}")]
    Deserialization(String),

    #[error(transparent)]
    DuplicateCorrelation(#[from] AlreadyRegistered),

    #[error("response channel closed before a response arrived")]
    ResponseChannelClosed,
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

/// Removes the registry entry if the call future is dropped before it
/// completes (caller cancelled). A no-op once the entry is resolved.
struct PendingGuard<'a> {
    registry: &'a CorrelationRegistry,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.cancel(&self.id);
    }
}

/// Makes a request over the exchange look like a synchronous call.
///
/// Clones share the broker and the registry; the [`ResponseListener`]
/// resolving that registry must be running for calls to complete.
///
/// [`ResponseListener`]: crate::listener::ResponseListener
#[derive(Clone)]
pub struct RpcClient {
    broker: BrokerPtr,
    registry: Arc<CorrelationRegistry>,
    exchange: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(
        broker: BrokerPtr,
        registry: Arc<CorrelationRegistry>,
        exchange: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            broker,
            registry,
            exchange: exchange.to_string(),
            timeout,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    /// Sends `payload` (or `{}` when absent) to `routing_key` and returns the
    /// raw JSON text of the response.
    pub async fn send<T>(&self, routing_key: &str, payload: Option<&T>) -> Result<String, RpcError>
    where
        T: Serialize + ?Sized,
    {
        self.send_with_timeout(routing_key, payload, self.timeout)
            .await
    }

    pub async fn send_with_timeout<T>(
        &self,
        routing_key: &str,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<String, RpcError>
    where
        T: Serialize + ?Sized,
    {
        let body = match payload {
            Some(payload) => serde_json::to_vec(payload).map_err(RpcError::Serialization)?,
            None => EMPTY_PAYLOAD.to_vec(),
        };
        let response = self.send_raw(routing_key, body, timeout).await?;
        String::from_utf8(response).map_err(|e| RpcError::Deserialization(e.to_string()))
    }

    /// Typed variant of [`RpcClient::send`].
    pub async fn call<T, R>(&self, routing_key: &str, request: &T) -> Result<R, RpcError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(RpcError::Serialization)?;
        let response = self.send_raw(routing_key, body, self.timeout).await?;
        serde_json::from_slice(&response).map_err(|e| RpcError::Deserialization(e.to_string()))
    }

    #[instrument(skip(self, body), fields(correlation_id = tracing::field::Empty))]
    pub async fn send_raw(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let id = CorrelationId::new();
        tracing::Span::current().record("correlation_id", tracing::field::display(id));

        // One deadline for the waiter and the registry entry, taken before
        // the publish so time spent publishing counts against the call
        let deadline = Instant::now() + timeout;

        // Register before publishing so a fast response always finds its waiter
        let reply_key = response_key(routing_key);
        let rx = self.registry.register_until(id, &reply_key, deadline)?;
        let _guard = PendingGuard {
            registry: &self.registry,
            id,
        };

        let envelope = Envelope::request(routing_key, body, id);
        self.broker.publish(&self.exchange, &envelope).await?;
        debug!("Request published, awaiting response");

        let timed_out = || {
            warn!(after = ?timeout, "Call timed out");
            RpcError::Timeout {
                routing_key: routing_key.to_string(),
                after: timeout,
            }
        };

        match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // The expiry sweep drops the entry once the deadline passes
            Ok(Err(_)) if Instant::now() >= deadline => Err(timed_out()),
            Ok(Err(_)) => Err(RpcError::ResponseChannelClosed),
            Err(_) => {
                self.registry.expire(&id);
                Err(timed_out())
            }
        }
    }
}
