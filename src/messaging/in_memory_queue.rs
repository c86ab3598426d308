//! In-process queue with the same delivery contract as the PostgreSQL queue.
//!
//! Used by tests and single-process deployments. Messages read but not acknowledged
//! become visible again once their visibility timeout lapses, so redelivery behaves
//! like the durable queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use super::errors::{MessagingError, MessagingResult};
use super::message::{Lane, QueuedMessage, TaskHandle};
use super::TaskQueue;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: serde_json::Value,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
}

/// A message moved out of its lane by [`TaskQueue::archive`]
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedMessage {
    pub handle: TaskHandle,
    pub payload: serde_json::Value,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    next_id: AtomicI64,
    // Ordered by message id so reads are FIFO among visible messages
    lanes: Mutex<HashMap<Lane, BTreeMap<i64, StoredMessage>>>,
    archived: Mutex<Vec<ArchivedMessage>>,
    reject_submits: AtomicBool,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, `submit` fails as an unreachable broker would. Reads and acks still work.
    pub fn set_rejecting_submits(&self, reject: bool) {
        self.reject_submits.store(reject, Ordering::SeqCst);
    }

    pub fn archived(&self) -> Vec<ArchivedMessage> {
        self.archived.lock().clone()
    }

    /// Payloads currently on a lane, in message order
    pub fn pending_payloads(&self, lane: Lane) -> Vec<serde_json::Value> {
        self.lanes
            .lock()
            .get(&lane)
            .map(|messages| messages.values().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn submit(&self, lane: Lane, payload: serde_json::Value) -> MessagingResult<TaskHandle> {
        if self.reject_submits.load(Ordering::SeqCst) {
            return Err(MessagingError::Unavailable(format!("lane {lane} rejected submit")));
        }
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = StoredMessage {
            payload,
            read_count: 0,
            enqueued_at: Utc::now(),
            visible_at: Instant::now(),
        };
        self.lanes
            .lock()
            .entry(lane)
            .or_default()
            .insert(message_id, stored);

        debug!(lane = %lane, message_id = message_id, "📤 Message submitted");
        Ok(TaskHandle { lane, message_id })
    }

    async fn read(
        &self,
        lane: Lane,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueuedMessage>> {
        let now = Instant::now();
        let mut lanes = self.lanes.lock();
        let Some(messages) = lanes.get_mut(&lane) else {
            return Ok(Vec::new());
        };

        let mut read = Vec::new();
        for (message_id, stored) in messages.iter_mut() {
            if read.len() >= limit {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            stored.read_count += 1;
            stored.visible_at = now + visibility_timeout;
            read.push(QueuedMessage {
                handle: TaskHandle {
                    lane,
                    message_id: *message_id,
                },
                payload: stored.payload.clone(),
                read_count: stored.read_count,
                enqueued_at: stored.enqueued_at,
            });
        }

        Ok(read)
    }

    async fn ack(&self, handle: &TaskHandle) -> MessagingResult<()> {
        let removed = self
            .lanes
            .lock()
            .get_mut(&handle.lane)
            .and_then(|messages| messages.remove(&handle.message_id));

        match removed {
            Some(_) => Ok(()),
            None => Err(MessagingError::MessageNotFound {
                lane: handle.lane,
                message_id: handle.message_id,
            }),
        }
    }

    async fn archive(&self, handle: &TaskHandle, reason: &str) -> MessagingResult<()> {
        let removed = self
            .lanes
            .lock()
            .get_mut(&handle.lane)
            .and_then(|messages| messages.remove(&handle.message_id));

        let Some(stored) = removed else {
            return Err(MessagingError::MessageNotFound {
                lane: handle.lane,
                message_id: handle.message_id,
            });
        };

        self.archived.lock().push(ArchivedMessage {
            handle: *handle,
            payload: stored.payload,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn depth(&self, lane: Lane) -> MessagingResult<i64> {
        Ok(self
            .lanes
            .lock()
            .get(&lane)
            .map(|messages| messages.len() as i64)
            .unwrap_or(0))
    }
}
