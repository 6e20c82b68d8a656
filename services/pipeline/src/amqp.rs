//! AMQP 0-9-1 broker client backed by `lapin`.

use crate::broker::{Broker, BrokerError, DeliveryStream};
use crate::config::AmqpConfig;
use crate::consumer::{Acknowledger, ConsumerError, IncomingMessage, MessageMetadata};
use crate::producer::{OutgoingMessage, ProducerError};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Broker client holding one connection, a publish channel and the queue names
pub struct AmqpBroker {
    connection: Connection,
    publisher: Mutex<Channel>,
    config: Arc<AmqpConfig>,
}

impl AmqpBroker {
    /// Connect to the broker and declare the job, update and result queues
    pub async fn connect(config: AmqpConfig) -> Result<Self, BrokerError> {
        info!(
            connection_name = %config.connection_name,
            "Connecting to AMQP broker"
        );

        let properties = ConnectionProperties::default()
            .with_connection_name(config.connection_name.clone().into());

        let connection = Connection::connect(&config.uri, properties)
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        // Publisher confirms, so a refused job surfaces as a publish error
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        declare_queues(&channel, &config).await?;

        Ok(Self {
            connection,
            publisher: Mutex::new(channel),
            config: Arc::new(config),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    fn consumer_tag(&self) -> String {
        format!("{}-{}", self.config.consumer.tag_prefix, Uuid::new_v4())
    }
}

/// Idempotently declare the three pipeline queues as durable,
/// non-exclusive and non-auto-deleted
async fn declare_queues(channel: &Channel, config: &AmqpConfig) -> Result<(), BrokerError> {
    let options = QueueDeclareOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
        ..QueueDeclareOptions::default()
    };

    for queue in config.queues.all() {
        channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::DeclareError {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        debug!(queue = %queue, "Declared durable queue");
    }

    Ok(())
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    #[instrument(skip(self, message), fields(queue = %message.queue, size_bytes = message.payload.len()))]
    async fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
        if !self.connection.status().connected() {
            return Err(ProducerError::Closed);
        }

        let properties = BasicProperties::default()
            .with_content_type(message.content_type.clone().into())
            .with_delivery_mode(message.delivery_mode.as_u8())
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
            .with_message_id(Uuid::new_v4().to_string().into());

        let publish_error = |e: lapin::Error| ProducerError::PublishError {
            queue: message.queue.clone(),
            message: e.to_string(),
        };

        // One publisher at a time on the shared channel
        let channel = self.publisher.lock().await;

        let confirm = channel
            .basic_publish(
                "",
                &message.queue,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(publish_error)?;

        let confirmation = confirm.await.map_err(publish_error)?;
        check_confirmation(&message.queue, confirmation)?;

        debug!("Message published");
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, ConsumerError> {
        let subscription_error = |e: lapin::Error| ConsumerError::SubscriptionError {
            queue: queue.to_string(),
            message: e.to_string(),
        };

        // Each subscription gets its own channel
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(subscription_error)?;

        if self.config.consumer.prefetch_count > 0 {
            channel
                .basic_qos(self.config.consumer.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(subscription_error)?;
        }

        let consumer = channel
            .basic_consume(
                queue,
                &self.consumer_tag(),
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(subscription_error)?;

        let queue = queue.to_string();
        let stream = consumer.map(move |delivery| {
            // The stream owns its channel for as long as it is consumed
            let _channel = &channel;
            delivery
                .map(|delivery| incoming_from_delivery(&queue, delivery))
                .map_err(|e| ConsumerError::DeliveryError(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        info!("Closing AMQP connection");
        if !self.connection.status().connected() {
            warn!("AMQP connection already closed");
            return Ok(());
        }

        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::ShutdownError(e.to_string()))
    }
}

/// Only a broker ack counts as published
fn check_confirmation(queue: &str, confirmation: Confirmation) -> Result<(), ProducerError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(ProducerError::PublishError {
            queue: queue.to_string(),
            message: "broker nacked the message".to_string(),
        }),
        Confirmation::NotRequested => Err(ProducerError::PublishError {
            queue: queue.to_string(),
            message: "publisher confirms are not enabled on the channel".to_string(),
        }),
    }
}

struct AmqpAcker {
    acker: Acker,
    delivery_tag: u64,
}

#[async_trait::async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), ConsumerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ConsumerError::AckError {
                delivery_tag: self.delivery_tag,
                message: e.to_string(),
            })
    }
}

fn incoming_from_delivery(queue: &str, delivery: Delivery) -> IncomingMessage {
    let metadata = MessageMetadata {
        queue: queue.to_string(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        timestamp: *delivery.properties.timestamp(),
    };

    let acker = AmqpAcker {
        acker: delivery.acker,
        delivery_tag: delivery.delivery_tag,
    };

    IncomingMessage::new(delivery.data, metadata, Arc::new(acker))
}
