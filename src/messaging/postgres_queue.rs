//! # PostgreSQL Task Queue
//!
//! Lane queues backed by pgmq through `pgmq::PGMQueue`, sharing the store's connection
//! pool. Each lane maps to one pgmq queue. pgmq hides a read message for the visibility
//! timeout and counts its reads in `read_ct`, so a crashed worker's message comes back
//! once the timeout lapses. Archived messages move to the lane's pgmq archive table.

use async_trait::async_trait;
use pgmq::{types::Message, PGMQueue};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::errors::{MessagingError, MessagingResult};
use super::message::{Lane, QueuedMessage, TaskHandle};
use super::TaskQueue;
use crate::constants::lanes;

/// Physical queue name for each lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneQueueNames {
    pub fast: String,
    pub image: String,
}

impl Default for LaneQueueNames {
    fn default() -> Self {
        Self {
            fast: lanes::FAST_QUEUE.to_string(),
            image: lanes::IMAGE_QUEUE.to_string(),
        }
    }
}

impl LaneQueueNames {
    pub fn queue_name(&self, lane: Lane) -> &str {
        match lane {
            Lane::Fast => &self.fast,
            Lane::Image => &self.image,
        }
    }
}

/// pgmq takes its visibility timeout in whole seconds
fn visibility_seconds(timeout: Duration) -> i32 {
    let secs = timeout.as_secs_f64().ceil();
    if secs >= f64::from(i32::MAX) {
        i32::MAX
    } else {
        secs as i32
    }
}

fn to_queued(lane: Lane, message: Message<serde_json::Value>) -> QueuedMessage {
    QueuedMessage {
        handle: TaskHandle {
            lane,
            message_id: message.msg_id,
        },
        payload: message.message,
        read_count: message.read_ct,
        enqueued_at: message.enqueued_at,
    }
}

#[derive(Debug, Clone)]
pub struct PostgresTaskQueue {
    pgmq: PGMQueue,
    queue_names: LaneQueueNames,
}

impl PostgresTaskQueue {
    /// Wrap an existing pool; the lane queues must exist, see [`Self::ensure_queues`]
    pub async fn new(pool: PgPool, queue_names: LaneQueueNames) -> Self {
        let pgmq = PGMQueue::new_with_pool(pool).await;
        Self { pgmq, queue_names }
    }

    /// Create the pgmq queue for every lane. Safe to call on every start.
    pub async fn ensure_queues(&self) -> MessagingResult<()> {
        for lane in Lane::ALL {
            let queue_name = self.queue_names.queue_name(lane);
            self.pgmq.create(queue_name).await?;
            debug!(queue = %queue_name, "📋 Lane queue ready");
        }
        info!("✅ Lane queues initialized");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pgmq.connection
    }
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    async fn submit(&self, lane: Lane, payload: serde_json::Value) -> MessagingResult<TaskHandle> {
        let queue_name = self.queue_names.queue_name(lane);
        let message_id = self.pgmq.send(queue_name, &payload).await?;

        debug!(queue = %queue_name, message_id = message_id, "📤 Message submitted");
        Ok(TaskHandle { lane, message_id })
    }

    async fn read(
        &self,
        lane: Lane,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueuedMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let queue_name = self.queue_names.queue_name(lane);
        let batch_size = i32::try_from(limit).unwrap_or(i32::MAX);

        let mut messages: Vec<QueuedMessage> = self
            .pgmq
            .read_batch::<serde_json::Value>(
                queue_name,
                Some(visibility_seconds(visibility_timeout)),
                batch_size,
            )
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(|message| to_queued(lane, message))
            .collect();
        messages.sort_by_key(|m| m.handle.message_id);

        debug!(queue = %queue_name, count = messages.len(), "📨 Messages read");
        Ok(messages)
    }

    async fn ack(&self, handle: &TaskHandle) -> MessagingResult<()> {
        let deleted = self
            .pgmq
            .delete(self.queue_names.queue_name(handle.lane), handle.message_id)
            .await?;

        if deleted == 0 {
            return Err(MessagingError::MessageNotFound {
                lane: handle.lane,
                message_id: handle.message_id,
            });
        }
        Ok(())
    }

    async fn archive(&self, handle: &TaskHandle, reason: &str) -> MessagingResult<()> {
        let archived = self
            .pgmq
            .archive(self.queue_names.queue_name(handle.lane), handle.message_id)
            .await?;

        if archived == 0 {
            return Err(MessagingError::MessageNotFound {
                lane: handle.lane,
                message_id: handle.message_id,
            });
        }

        // pgmq's archive table has no reason column, the log line is the record
        warn!(
            lane = %handle.lane,
            message_id = handle.message_id,
            reason = %reason,
            "🗄️ Message archived"
        );
        Ok(())
    }

    async fn depth(&self, lane: Lane) -> MessagingResult<i64> {
        // Queue names are validated by pgmq on create, so they are safe to splice
        let sql = format!(
            "SELECT COUNT(*) FROM pgmq.q_{}",
            self.queue_names.queue_name(lane)
        );
        let depth: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pgmq.connection)
            .await?;
        Ok(depth)
    }
}
