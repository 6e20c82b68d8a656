//! In-process broker with AMQP-like ack semantics.
//!
//! Used by tests and local runs. Deliveries move from `ready` to `unacked`
//! when handed to a subscriber and are dropped once acked; anything still
//! unacked when the broker shuts down (or `requeue_unacked` is called) goes
//! back to the front of `ready` flagged as redelivered.

use crate::broker::{Broker, BrokerError, DeliveryStream};
use crate::consumer::{Acknowledger, ConsumerError, IncomingMessage, MessageMetadata};
use crate::producer::{DeliveryMode, OutgoingMessage, ProducerError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    delivery_tag: u64,
    content_type: String,
    delivery_mode: DeliveryMode,
    payload: Vec<u8>,
    redelivered: bool,
    timestamp: u64,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, StoredMessage>,
    acked: usize,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    notify: Notify,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn take_next(self: &Arc<Self>, queue: &str) -> Option<IncomingMessage> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(queue)?;
        let message = state.ready.pop_front()?;
        state.unacked.insert(message.delivery_tag, message.clone());

        let metadata = MessageMetadata {
            queue: queue.to_string(),
            delivery_tag: message.delivery_tag,
            redelivered: message.redelivered,
            content_type: Some(message.content_type.clone()),
            timestamp: Some(message.timestamp),
        };
        let acker = MemoryAcker {
            inner: Arc::clone(self),
            queue: queue.to_string(),
            delivery_tag: message.delivery_tag,
        };

        Some(IncomingMessage::new(message.payload, metadata, Arc::new(acker)))
    }
}

/// Broker that keeps every queue in memory
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create a broker with the given queues declared
    pub fn with_queues<'a>(queues: impl IntoIterator<Item = &'a str>) -> Self {
        let broker = Self::default();
        {
            let mut map = broker.inner.queues.lock();
            for queue in queues {
                map.entry(queue.to_string()).or_default();
            }
        }
        broker
    }

    /// Number of messages waiting to be delivered
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of deliveries handed out but not yet acked
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Number of deliveries acked so far
    pub fn acked_count(&self, queue: &str) -> usize {
        self.inner.queues.lock().get(queue).map_or(0, |q| q.acked)
    }

    /// Payloads and delivery modes of messages waiting in `queue`, oldest first
    pub fn ready_messages(&self, queue: &str) -> Vec<(DeliveryMode, Vec<u8>)> {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| (m.delivery_mode, m.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Return every unacked delivery to the front of its queue, as the
    /// broker does when a consumer's channel dies
    pub fn requeue_unacked(&self, queue: &str) -> usize {
        let requeued = {
            let mut queues = self.inner.queues.lock();
            let Some(state) = queues.get_mut(queue) else {
                return 0;
            };
            let unacked = std::mem::take(&mut state.unacked);
            let count = unacked.len();
            for (_, mut message) in unacked.into_iter().rev() {
                message.redelivered = true;
                state.ready.push_front(message);
            }
            count
        };

        if requeued > 0 {
            self.inner.notify.notify_waiters();
        }
        requeued
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ProducerError::Closed);
        }

        {
            let mut queues = self.inner.queues.lock();
            let state = queues
                .get_mut(&message.queue)
                .ok_or_else(|| ProducerError::PublishError {
                    queue: message.queue.clone(),
                    message: "queue not declared".to_string(),
                })?;

            let delivery_tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            state.ready.push_back(StoredMessage {
                delivery_tag,
                content_type: message.content_type,
                delivery_mode: message.delivery_mode,
                payload: message.payload,
                redelivered: false,
                timestamp: chrono::Utc::now().timestamp() as u64,
            });
        }

        debug!(queue = %message.queue, "Message published to memory broker");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, ConsumerError> {
        if !self.inner.queues.lock().contains_key(queue) {
            return Err(ConsumerError::SubscriptionError {
                queue: queue.to_string(),
                message: "queue not declared".to_string(),
            });
        }

        let state = (Arc::clone(&self.inner), queue.to_string());
        let stream = futures::stream::unfold(state, |(inner, queue)| async move {
            loop {
                // Register before checking so a concurrent publish is not missed
                let notified = inner.notify.notified();
                if inner.closed.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(message) = inner.take_next(&queue) {
                    drop(notified);
                    return Some((Ok(message), (inner, queue)));
                }
                notified.await;
            }
        });

        Ok(Box::pin(stream))
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        self.inner.closed.store(true, Ordering::SeqCst);

        let queue_names: Vec<String> = self.inner.queues.lock().keys().cloned().collect();
        for queue in queue_names {
            self.requeue_unacked(&queue);
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    delivery_tag: u64,
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), ConsumerError> {
        let mut queues = self.inner.queues.lock();
        let removed = queues.get_mut(&self.queue).and_then(|state| {
            state.unacked.remove(&self.delivery_tag)?;
            state.acked += 1;
            Some(())
        });

        removed.ok_or_else(|| ConsumerError::AckError {
            delivery_tag: self.delivery_tag,
            message: "unknown delivery tag".to_string(),
        })
    }
}
