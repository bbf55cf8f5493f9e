// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Errors raised by the broker layer: connecting, declaring, publishing,
/// consuming and acknowledging.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Broker connection error: {0}")]
    ConnectionError(String),

    #[error("Broker channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Topology error: {0}")]
    TopologyError(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Consume error: {0}")]
    ConsumeError(String),

    #[error("Acknowledge error: {0}")]
    AckError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// True when the error means the broker itself went away, as opposed to a
    /// rejected operation on a healthy connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionError(_) | BridgeError::ChannelError(_)
        )
    }
}

// lapin reports most failures as a status/protocol string, so classify by text
impl From<LapinError> for BridgeError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            BridgeError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            BridgeError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            BridgeError::PublishError(error_text)
        } else if lowered.contains("consume") {
            BridgeError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            BridgeError::AckError(error_text)
        } else {
            BridgeError::Unknown(error_text)
        }
    }
}

impl From<Elapsed> for BridgeError {
    fn from(_: Elapsed) -> Self {
        BridgeError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<String> for BridgeError {
    fn from(message: String) -> Self {
        BridgeError::Unknown(message)
    }
}

impl From<&str> for BridgeError {
    fn from(message: &str) -> Self {
        BridgeError::Unknown(message.to_string())
    }
}
