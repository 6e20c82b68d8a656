//! The broker seam shared by publishers and consumers.

use crate::consumer::{ConsumerError, IncomingMessage};
use crate::producer::{OutgoingMessage, ProducerError};
use futures::stream::BoxStream;
use thiserror::Error;

/// Stream of deliveries from one queue
pub type DeliveryStream = BoxStream<'static, Result<IncomingMessage, ConsumerError>>;

/// Errors raised while connecting to or tearing down a broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    ConnectionError(String),

    #[error("Failed to declare queue {queue}: {message}")]
    DeclareError { queue: String, message: String },

    #[error("Failed to close broker connection: {0}")]
    ShutdownError(String),
}

/// A durable message broker with publish and manual-ack subscribe.
///
/// Implementations must be safe to share between request handlers; concurrent
/// publishes are serialized internally.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Publish one message to its queue on the default exchange
    async fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError>;

    /// Start consuming from `queue`. Deliveries must be acked explicitly;
    /// unacked deliveries are redelivered when the consumer goes away.
    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, ConsumerError>;

    /// Close the underlying connection
    async fn shutdown(&self) -> Result<(), BrokerError>;
}
