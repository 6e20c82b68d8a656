//! Queue consumer primitives for the emote pipeline.
//!
//! Deliveries are never auto-acknowledged. A [`Subscription`] drives a
//! [`MessageHandler`] over a delivery stream and acknowledges each delivery
//! once the handler has returned, until its cancellation token fires.

use crate::broker::{Broker, DeliveryStream};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to subscribe to queue {queue}: {message}")]
    SubscriptionError { queue: String, message: String },

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Failed to acknowledge delivery {delivery_tag}: {message}")]
    AckError { delivery_tag: u64, message: String },

    #[error("Delivery error: {0}")]
    DeliveryError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),
}

/// Metadata about a received delivery
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Queue the delivery was received from
    pub queue: String,
    /// Broker-assigned delivery tag
    pub delivery_tag: u64,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// Content type property, if set by the publisher
    pub content_type: Option<String>,
    /// Publish timestamp (unix seconds), if set by the publisher
    pub timestamp: Option<u64>,
}

/// Acknowledges a single delivery back to the broker
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), ConsumerError>;
}

/// A received delivery awaiting acknowledgement
#[derive(Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Delivery metadata
    pub metadata: MessageMetadata,
    acker: Arc<dyn Acknowledger>,
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl IncomingMessage {
    pub fn new(payload: Vec<u8>, metadata: MessageMetadata, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            payload,
            metadata,
            acker,
        }
    }

    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    /// Acknowledge the delivery. Consumes the message so it can only be acked once.
    pub async fn ack(self) -> Result<(), ConsumerError> {
        self.acker.ack().await
    }
}

/// Handler trait for processing deliveries
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single delivery
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: &IncomingMessage, error: ConsumerError) {
        warn!(
            queue = %message.metadata.queue,
            delivery_tag = message.metadata.delivery_tag,
            error = %error,
            "Message processing failed"
        );
    }
}

/// A live subscription to one queue
pub struct Subscription {
    queue: String,
    stream: DeliveryStream,
}

impl Subscription {
    /// Subscribe to `queue` on the given broker
    pub async fn open(broker: &dyn Broker, queue: &str) -> Result<Self, ConsumerError> {
        let stream = broker.subscribe(queue).await?;
        info!(queue = %queue, "Subscribed to queue");
        Ok(Self {
            queue: queue.to_string(),
            stream,
        })
    }

    /// Consume deliveries until `cancel` fires or the stream ends.
    ///
    /// Every delivery is acknowledged after the handler returns, whether it
    /// succeeded or not. Failed deliveries are reported through
    /// [`MessageHandler::on_error`] and are not requeued.
    #[instrument(skip(self, handler, cancel), fields(queue = %self.queue))]
    pub async fn run<H>(mut self, handler: &H, cancel: CancellationToken) -> Result<(), ConsumerError>
    where
        H: MessageHandler + ?Sized,
    {
        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Received shutdown signal");
                    break;
                }
                next = self.stream.next() => {
                    match next {
                        Some(Ok(message)) => {
                            debug!(
                                delivery_tag = message.metadata.delivery_tag,
                                redelivered = message.metadata.redelivered,
                                size_bytes = message.payload.len(),
                                "Received delivery"
                            );

                            if let Err(e) = handler.handle(&message).await {
                                handler.on_error(&message, e).await;
                            }

                            if let Err(e) = message.ack().await {
                                warn!(error = %e, "Failed to acknowledge delivery");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Broker delivery error");
                        }
                        None => {
                            metrics::counter!(
                                "pipeline.subscription.stream_ended",
                                "queue" => self.queue.clone()
                            )
                            .increment(1);
                            error!("Delivery stream ended, no further deliveries will be consumed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAcker(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self) -> Result<(), ConsumerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message(payload: &[u8], acks: Arc<AtomicUsize>) -> IncomingMessage {
        IncomingMessage::new(
            payload.to_vec(),
            MessageMetadata {
                queue: "updates".to_string(),
                delivery_tag: 7,
                redelivered: false,
                content_type: Some("application/json".to_string()),
                timestamp: None,
            },
            Arc::new(CountingAcker(acks)),
        )
    }

    #[test]
    fn test_decode_json_reports_deserialization_error() {
        let message = message(b"not json", Arc::new(AtomicUsize::new(0)));
        let decoded: Result<serde_json::Value, _> = message.decode_json();
        assert!(matches!(decoded, Err(ConsumerError::DeserializationError(_))));
    }

    #[tokio::test]
    async fn test_ack_goes_through_acknowledger() {
        let acks = Arc::new(AtomicUsize::new(0));
        let message = message(b"{}", acks.clone());
        message.ack().await.unwrap();
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_omits_payload() {
        let message = message(b"secret", Arc::new(AtomicUsize::new(0)));
        let rendered = format!("{:?}", message);
        assert!(rendered.contains("payload_len: 6"));
        assert!(!rendered.contains("secret"));
    }

    struct Noop;

    #[async_trait::async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _message: &IncomingMessage) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_returns_when_stream_ends() {
        let acks = Arc::new(AtomicUsize::new(0));
        let deliveries = vec![
            Ok(message(b"{}", acks.clone())),
            Ok(message(b"{}", acks.clone())),
        ];
        let subscription = Subscription {
            queue: "updates".to_string(),
            stream: futures::stream::iter(deliveries).boxed(),
        };

        // The token is never cancelled; only the end of the stream stops the loop
        let cancel = CancellationToken::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            subscription.run(&Noop, cancel),
        )
        .await
        .expect("loop should stop when the stream ends")
        .unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }
}
