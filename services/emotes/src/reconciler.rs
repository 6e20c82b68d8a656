//! Folds worker events back into emote records.
//!
//! Two independent loops run until the shared cancellation token fires:
//!
//! - **update queue**: records the stage in the status cache, moves the
//!   emote to `PROCESSING` on `started` and to `LIVE` on `completed`
//! - **result queue**: marks the emote `FAILED`, or replaces its formats
//!   and marks it `LIVE`
//!
//! Every delivery is acked once handled, including ones that fail to decode
//! or whose write fails. Nothing is retried.

use crate::emote_store::EmoteStore;
use crate::model::{EmoteFormat, EmoteSize, EmoteStatus};
use crate::status_cache::StatusCache;
use emote_pipeline::prelude::*;
use emote_pipeline::{JobOutcome, QueueConfig, ResultEvent, ResultFile, UpdateEvent, UpdateStage};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Status an update stage moves the emote to, if any
pub fn status_for_stage(stage: &UpdateStage) -> Option<EmoteStatus> {
    match stage {
        UpdateStage::Started => Some(EmoteStatus::Processing),
        UpdateStage::Completed => Some(EmoteStatus::Live),
        _ => None,
    }
}

/// Group result files into formats by content type, keeping first-seen order
pub fn group_formats(files: &[ResultFile]) -> Vec<EmoteFormat> {
    let mut formats: Vec<EmoteFormat> = Vec::new();
    for file in files {
        let size = EmoteSize {
            name: file.name.clone(),
            width: file.width,
            height: file.height,
            animated: file.animated,
            processing_time: file.time_taken,
            length: file.size,
        };

        match formats.iter_mut().find(|f| f.name == file.content_type) {
            Some(format) => format.sizes.push(size),
            None => formats.push(EmoteFormat {
                name: file.content_type.clone(),
                sizes: vec![size],
            }),
        }
    }
    formats
}

fn record_transition(status: EmoteStatus) {
    metrics::counter!("emotes.status.transitions", "status" => status.as_str()).increment(1);
}

fn report_failure(queue: &str, delivery_tag: u64, error: ConsumerError) {
    match error {
        ConsumerError::DeserializationError(reason) => {
            metrics::counter!("emotes.events.malformed").increment(1);
            error!(queue = %queue, delivery_tag, error = %reason, "Malformed event payload, dropping");
        }
        other => {
            metrics::counter!("emotes.events.store_errors").increment(1);
            error!(queue = %queue, delivery_tag, error = %other, "Failed to apply event");
        }
    }
}

/// Handles stage updates from the worker
pub struct UpdateHandler {
    store: Arc<dyn EmoteStore>,
    cache: Arc<dyn StatusCache>,
    status_ttl: Duration,
}

impl UpdateHandler {
    pub fn new(store: Arc<dyn EmoteStore>, cache: Arc<dyn StatusCache>, status_ttl: Duration) -> Self {
        Self {
            store,
            cache,
            status_ttl,
        }
    }

    #[instrument(skip(self, event), fields(emote_id = %event.job_id, stage = %event.stage))]
    async fn apply(&self, event: UpdateEvent) -> Result<(), ConsumerError> {
        if let Err(e) = self
            .cache
            .set(&event.job_id, event.stage.as_str(), self.status_ttl)
            .await
        {
            warn!(error = %e, "Failed to cache processing stage");
        }

        if let UpdateStage::Unknown(tag) = &event.stage {
            debug!(tag = %tag, "Ignoring unknown stage");
            return Ok(());
        }

        let Some(status) = status_for_stage(&event.stage) else {
            return Ok(());
        };

        let matched = self
            .store
            .update_status(&event.job_id, status)
            .await
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))?;

        if matched {
            record_transition(status);
            info!(status = %status, "Emote status updated");
        } else {
            warn!(status = %status, "No emote matched update event");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for UpdateHandler {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        let event: UpdateEvent = message.decode_json()?;
        metrics::counter!("emotes.events.decoded").increment(1);
        self.apply(event).await
    }

    async fn on_error(&self, message: &IncomingMessage, error: ConsumerError) {
        report_failure(&message.metadata.queue, message.metadata.delivery_tag, error);
    }
}

/// Handles terminal job results from the worker
pub struct ResultHandler {
    store: Arc<dyn EmoteStore>,
}

impl ResultHandler {
    pub fn new(store: Arc<dyn EmoteStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, outcome), fields(emote_id = %job_id))]
    async fn apply(&self, job_id: String, outcome: JobOutcome) -> Result<(), ConsumerError> {
        let (status, matched) = match outcome {
            JobOutcome::Failed { error } => {
                warn!(worker_error = %error, "Emote processing failed");
                let matched = self
                    .store
                    .update_status(&job_id, EmoteStatus::Failed)
                    .await
                    .map_err(|e| ConsumerError::ProcessingError(e.to_string()))?;
                (EmoteStatus::Failed, matched)
            }
            JobOutcome::Succeeded { files } => {
                let formats = group_formats(&files);
                let matched = self
                    .store
                    .replace_formats(&job_id, &formats, EmoteStatus::Live)
                    .await
                    .map_err(|e| ConsumerError::ProcessingError(e.to_string()))?;
                info!(
                    format_count = formats.len(),
                    file_count = files.len(),
                    "Emote formats stored"
                );
                (EmoteStatus::Live, matched)
            }
        };

        if matched {
            record_transition(status);
        } else {
            warn!(status = %status, "No emote matched result event");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ResultHandler {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), ConsumerError> {
        let event: ResultEvent = message.decode_json()?;
        metrics::counter!("emotes.events.decoded").increment(1);
        let (job_id, outcome) = event.into_outcome();
        self.apply(job_id, outcome).await
    }

    async fn on_error(&self, message: &IncomingMessage, error: ConsumerError) {
        report_failure(&message.metadata.queue, message.metadata.delivery_tag, error);
    }
}

/// Running reconciler loops
pub struct ReconcilerHandles {
    update: JoinHandle<()>,
    result: JoinHandle<()>,
}

impl ReconcilerHandles {
    /// Wait for both loops to finish
    pub async fn join(self) {
        for (name, handle) in [("update", self.update), ("result", self.result)] {
            if let Err(e) = handle.await {
                error!(reconciler = name, error = %e, "Reconciler task panicked");
            }
        }
    }
}

/// Subscribes both loops and spawns them onto the runtime
pub struct Reconciler {
    broker: Arc<dyn Broker>,
    queues: QueueConfig,
    store: Arc<dyn EmoteStore>,
    cache: Arc<dyn StatusCache>,
    status_ttl: Duration,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn Broker>,
        queues: QueueConfig,
        store: Arc<dyn EmoteStore>,
        cache: Arc<dyn StatusCache>,
        status_ttl: Duration,
    ) -> Self {
        Self {
            broker,
            queues,
            store,
            cache,
            status_ttl,
        }
    }

    /// Subscribe to the update and result queues and start both loops.
    /// They stop when `cancel` fires.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<ReconcilerHandles, ConsumerError> {
        let updates = Subscription::open(self.broker.as_ref(), &self.queues.update).await?;
        let results = Subscription::open(self.broker.as_ref(), &self.queues.result).await?;

        let update_handler = UpdateHandler::new(self.store.clone(), self.cache, self.status_ttl);
        let result_handler = ResultHandler::new(self.store);

        let update = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = updates.run(&update_handler, cancel).await {
                    error!(error = %e, "Update reconciler stopped");
                }
            })
        };
        let result = tokio::spawn(async move {
            if let Err(e) = results.run(&result_handler, cancel).await {
                error!(error = %e, "Result reconciler stopped");
            }
        });

        info!(
            update_queue = %self.queues.update,
            result_queue = %self.queues.result,
            "Reconciler started"
        );
        Ok(ReconcilerHandles { update, result })
    }
}
