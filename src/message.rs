use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Prefix that turns a request routing key into its response routing key.
pub const RESPONSE_PREFIX: &str = "response.";

/// Message body used when a call carries no payload.
pub const EMPTY_PAYLOAD: &[u8] = b"{}";

/// Returns the response routing key for a request routing key,
/// e.g. `user.login` -> `response.user.login`.
pub fn response_key(routing_key: &str) -> String {
    format!("{}{}", RESPONSE_PREFIX, routing_key)
}

/// Inverse of [`response_key`]. Returns `None` for keys that are not responses.
pub fn request_key(response_key: &str) -> Option<&str> {
    response_key.strip_prefix(RESPONSE_PREFIX)
}

/// Process-unique identity of one in-flight call.
///
/// Travels in the AMQP `correlation_id` property and is echoed back by the
/// worker; the routing key never identifies a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(CorrelationId)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message as it travels through the exchange.
///
/// The body is UTF-8 JSON owned by the receiving service. Correlation and
/// deduplication ride alongside the body as message properties, so the body
/// a caller receives is exactly what the worker published.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub correlation_id: Option<CorrelationId>,
    /// Dedup key; stays the same when a request is redelivered.
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Builds an outgoing request with a fresh dedup key.
    pub fn request(routing_key: &str, payload: Vec<u8>, correlation_id: CorrelationId) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            payload,
            correlation_id: Some(correlation_id),
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Utc::now(),
        }
    }

    /// Builds the response to `request`, echoing its correlation id and
    /// addressed to `response.<request key>`.
    pub fn response_to(request: &Envelope, payload: Vec<u8>) -> Self {
        Self {
            routing_key: response_key(&request.routing_key),
            payload,
            correlation_id: request.correlation_id,
            message_id: request.message_id.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// `{success, message}` body returned by simple (command) operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub success: bool,
    pub message: String,
}

/// What a worker handler hands back for one request.
///
/// Commands answer with a [`StatusReply`]; queries answer with the raw
/// domain payload. Both serialize without a tag so the wire shape callers
/// already depend on is kept as is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Status(StatusReply),
    Data(Value),
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Reply::Status(StatusReply {
            success: true,
            message: message.into(),
        })
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Reply::Status(StatusReply {
            success: false,
            message: message.into(),
        })
    }

    pub fn status(success: bool, message: impl Into<String>) -> Self {
        Reply::Status(StatusReply {
            success,
            message: message.into(),
        })
    }

    /// Wraps any serializable query result. A value that cannot be
    /// represented as JSON becomes a failure envelope.
    pub fn data<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Reply::Data(value),
            Err(e) => Reply::failure(format!("Response could not be serialized: {}", e)),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Reply::Status(StatusReply { success: false, .. }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Value and StatusReply always serialize
        serde_json::to_vec(self).unwrap_or_else(|_| EMPTY_PAYLOAD.to_vec())
    }
}
