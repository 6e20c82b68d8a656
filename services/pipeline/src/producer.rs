//! Outgoing message types for the emote pipeline.
//!
//! Messages are addressed to a queue on the default exchange and carry an
//! explicit content type and delivery mode.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during message publishing
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to publish message to queue {queue}: {message}")]
    PublishError { queue: String, message: String },

    #[error("Broker connection is closed")]
    Closed,
}

/// AMQP delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Message may be lost if the broker restarts
    Transient = 1,
    /// Message is written to disk by the broker
    Persistent = 2,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Message to be published to a queue
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Destination queue (routing key on the default exchange)
    pub queue: String,
    /// MIME type of the payload
    pub content_type: String,
    /// Delivery mode
    pub delivery_mode: DeliveryMode,
    /// Serialized message payload
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a raw payload
    pub fn new(
        queue: impl Into<String>,
        content_type: impl Into<String>,
        delivery_mode: DeliveryMode,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            queue: queue.into(),
            content_type: content_type.into(),
            delivery_mode,
            payload,
        }
    }

    /// Create a new transient outgoing message with a JSON payload
    pub fn new_json<T: Serialize>(
        queue: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self::new(
            queue,
            "application/json",
            DeliveryMode::Transient,
            payload,
        ))
    }

    /// Mark the message as persistent
    pub fn persistent(mut self) -> Self {
        self.delivery_mode = DeliveryMode::Persistent;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_message_is_persistent_when_requested() {
        let message = OutgoingMessage::new_json("jobs", &serde_json::json!({"id": "abc"}))
            .unwrap()
            .persistent();

        assert_eq!(message.queue, "jobs");
        assert_eq!(message.content_type, "application/json");
        assert_eq!(message.delivery_mode.as_u8(), 2);
        assert_eq!(message.payload, br#"{"id":"abc"}"#);
    }

    #[test]
    fn test_delivery_mode_values() {
        assert_eq!(DeliveryMode::Transient.as_u8(), 1);
        assert_eq!(DeliveryMode::Persistent.as_u8(), 2);
    }
}
