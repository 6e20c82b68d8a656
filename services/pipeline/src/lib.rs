//! Emote Pipeline - AMQP messaging for emote processing
//!
//! This library connects the emote upload service to the external processing
//! worker through three durable queues:
//!
//! - **job**: job descriptors published by the upload path (persistent delivery)
//! - **update**: stage progress reported by the worker
//! - **result**: the terminal outcome of each job
//!
//! Consumers never auto-ack; a [`Subscription`] acknowledges each delivery
//! after its handler returns and stops when its cancellation token fires.
//!
//! # Example
//!
//! ```rust,no_run
//! use emote_pipeline::{AmqpBroker, AmqpConfig, Broker, OutgoingMessage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AmqpConfig::from_env()?;
//!     let job_queue = config.queues.job.clone();
//!     let broker = AmqpBroker::connect(config).await?;
//!
//!     let message = OutgoingMessage::new_json(job_queue, &serde_json::json!({"id": "1"}))?
//!         .persistent();
//!     broker.publish(message).await?;
//!
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod events;
pub mod memory;
pub mod producer;

// Re-export main types
pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerError, DeliveryStream};
pub use config::{AmqpConfig, ConfigError, ConsumerConfig, QueueConfig};
pub use consumer::{
    async_trait, Acknowledger, ConsumerError, IncomingMessage, MessageHandler, MessageMetadata,
    Subscription,
};
pub use events::{
    ConsumerDetails, JobDescriptor, JobOutcome, ProviderDetails, ResultEvent, ResultFile,
    StorageKind, UpdateEvent, UpdateStage,
};
pub use memory::MemoryBroker;
pub use producer::{DeliveryMode, OutgoingMessage, ProducerError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::Broker;
    pub use crate::config::AmqpConfig;
    pub use crate::consumer::{
        async_trait, ConsumerError, IncomingMessage, MessageHandler, Subscription,
    };
    pub use crate::producer::{DeliveryMode, OutgoingMessage, ProducerError};
}
