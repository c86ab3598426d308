//! # Messaging
//!
//! The distributed-queue seam: lane-named, at-least-once delivery with visibility
//! timeouts in the style of pgmq. A message read from a lane stays invisible to other
//! readers until it is acknowledged, archived, or its visibility timeout lapses, at
//! which point it is delivered again.

pub mod errors;
pub mod in_memory_queue;
pub mod message;
pub mod postgres_queue;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory_queue::InMemoryTaskQueue;
pub use message::{
    DispatchRegistration, EnqueueReason, ImageUnitMessage, ImageUnitMessageMetadata, Lane,
    QueuedMessage, TaskHandle,
};
pub use postgres_queue::{LaneQueueNames, PostgresTaskQueue};

#[async_trait]
pub trait TaskQueue: Send + Sync + std::fmt::Debug {
    /// Put a payload on a lane; returns immediately with its handle
    async fn submit(&self, lane: Lane, payload: serde_json::Value) -> MessagingResult<TaskHandle>;

    /// Read up to `limit` visible messages, hiding them for `visibility_timeout`
    async fn read(
        &self,
        lane: Lane,
        visibility_timeout: Duration,
        limit: usize,
    ) -> MessagingResult<Vec<QueuedMessage>>;

    /// Delete a processed message
    async fn ack(&self, handle: &TaskHandle) -> MessagingResult<()>;

    /// Move a message that should never be retried out of the lane
    async fn archive(&self, handle: &TaskHandle, reason: &str) -> MessagingResult<()>;

    /// Number of messages on a lane, visible or in flight
    async fn depth(&self, lane: Lane) -> MessagingResult<i64>;
}

/// Serialize and submit a typed message
pub async fn submit_message<T: Serialize + Sync>(
    queue: &dyn TaskQueue,
    lane: Lane,
    message: &T,
) -> MessagingResult<TaskHandle> {
    let payload = serde_json::to_value(message)?;
    queue.submit(lane, payload).await
}
