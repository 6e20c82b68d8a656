//! Processing job publication.

use crate::stager::StagedObject;
use emote_pipeline::{
    Broker, ConsumerDetails, JobDescriptor, OutgoingMessage, ProducerError, ProviderDetails,
    StorageKind,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to publish job: {0}")]
    Publish(#[from] ProducerError),
}

/// Publishes processing jobs to the job queue
#[derive(Clone)]
pub struct JobDispatcher {
    broker: Arc<dyn Broker>,
    job_queue: String,
    public_bucket: String,
}

impl JobDispatcher {
    pub fn new(broker: Arc<dyn Broker>, job_queue: impl Into<String>, public_bucket: impl Into<String>) -> Self {
        Self {
            broker,
            job_queue: job_queue.into(),
            public_bucket: public_bucket.into(),
        }
    }

    /// Job asking the worker to process `input` and write outputs under `emote/{id}`
    pub fn job_for(&self, id: &str, input: &StagedObject) -> JobDescriptor {
        JobDescriptor {
            id: id.to_string(),
            provider_kind: StorageKind::Aws,
            provider_details: ProviderDetails {
                bucket: input.bucket.clone(),
                key: input.key.clone(),
            },
            consumer_kind: StorageKind::Aws,
            consumer_details: ConsumerDetails {
                bucket: self.public_bucket.clone(),
                key_prefix: format!("emote/{}", id),
            },
        }
    }

    #[instrument(skip(self, input), fields(emote_id = %id, queue = %self.job_queue))]
    pub async fn dispatch(&self, id: &str, input: &StagedObject) -> Result<(), DispatchError> {
        let job = self.job_for(id, input);
        let message = OutgoingMessage::new_json(&self.job_queue, &job)?.persistent();
        self.broker.publish(message).await?;

        info!("Processing job dispatched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emote_pipeline::{DeliveryMode, MemoryBroker};

    #[tokio::test]
    async fn test_dispatch_publishes_persistent_job() {
        let broker = MemoryBroker::with_queues(["jobs"]);
        let dispatcher = JobDispatcher::new(Arc::new(broker.clone()), "jobs", "cdn");
        let staged = StagedObject {
            bucket: "raw".to_string(),
            key: "internal/emote/abc.png".to_string(),
        };

        tokio_test::assert_ok!(dispatcher.dispatch("abc", &staged).await);

        let messages = broker.ready_messages("jobs");
        assert_eq!(messages.len(), 1);
        let (mode, payload) = &messages[0];
        assert_eq!(*mode, DeliveryMode::Persistent);

        let job: JobDescriptor = serde_json::from_slice(payload).unwrap();
        assert_eq!(job.id, "abc");
        assert_eq!(job.provider_details.bucket, "raw");
        assert_eq!(job.provider_details.key, "internal/emote/abc.png");
        assert_eq!(job.consumer_details.bucket, "cdn");
        assert_eq!(job.consumer_details.key_prefix, "emote/abc");
    }

    #[tokio::test]
    async fn test_dispatch_failure_surfaces() {
        let broker = MemoryBroker::with_queues(["other"]);
        let dispatcher = JobDispatcher::new(Arc::new(broker), "jobs", "cdn");
        let staged = StagedObject {
            bucket: "raw".to_string(),
            key: "abc.png".to_string(),
        };

        assert!(matches!(
            dispatcher.dispatch("abc", &staged).await,
            Err(DispatchError::Publish(ProducerError::PublishError { .. }))
        ));
    }
}
