use lapin::{options::*, BasicProperties, Channel, Connection};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{BridgeError, Result};
use crate::message::Envelope;

/// Configuration options for the process' channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Wait for broker confirms on every publish
    pub confirm_mode: bool,

    /// Channel identifier for logging
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            confirm_mode: true,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

/// Holds the one channel shared by every publisher and consumer in the
/// process. Publishing goes through a single writer lock because a lapin
/// channel must not interleave concurrent publishes.
pub struct ChannelManager {
    channel: RwLock<Option<Channel>>,
    publish_lock: Mutex<()>,
    config: ChannelConfig,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Self {
        debug!(channel_id = %config.id, confirm = %config.confirm_mode, "Creating channel manager");
        Self {
            channel: RwLock::new(None),
            publish_lock: Mutex::new(()),
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Opens a fresh channel on `connection` and makes it current.
    pub async fn open(&self, connection: &Connection) -> Result<Channel> {
        debug!(channel_id = %self.config.id, "Creating new channel");
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BridgeError::ChannelError(e.to_string()))?;

        if self.config.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BridgeError::ChannelError(format!("Failed to enable confirms: {}", e)))?;
        }

        let mut guard = self
            .channel
            .write()
            .map_err(|_| BridgeError::ChannelError("Channel lock poisoned".to_string()))?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// Returns a handle to the current channel if it is still open.
    pub fn get_channel(&self) -> Result<Channel> {
        let guard = self
            .channel
            .read()
            .map_err(|_| BridgeError::ChannelError("Channel lock poisoned".to_string()))?;

        match &*guard {
            Some(channel) if channel.status().connected() => Ok(channel.clone()),
            _ => Err(BridgeError::ChannelError("Channel is not available".to_string())),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.get_channel().is_ok()
    }

    pub async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        let channel = self.get_channel()?;
        let _writer = self.publish_lock.lock().await;

        let confirm = channel
            .basic_publish(
                exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties_for(envelope),
            )
            .await
            .map_err(|e| BridgeError::PublishError(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| BridgeError::PublishError(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(BridgeError::PublishError(format!(
                "broker refused message for '{}'",
                envelope.routing_key
            )));
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let channel = self
            .channel
            .write()
            .map_err(|_| BridgeError::ChannelError("Channel lock poisoned".to_string()))?
            .take();
        if let Some(channel) = channel {
            if channel.status().connected() {
                channel.close(0, "Closing channel").await?;
            }
        }
        Ok(())
    }
}

/// AMQP properties carrying the envelope metadata next to the JSON body.
pub fn properties_for(envelope: &Envelope) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_timestamp(envelope.timestamp.timestamp().max(0) as u64);

    if let Some(correlation_id) = envelope.correlation_id {
        properties = properties.with_correlation_id(correlation_id.to_string().into());
    }
    if let Some(message_id) = &envelope.message_id {
        properties = properties.with_message_id(message_id.clone().into());
    }
    properties
}
