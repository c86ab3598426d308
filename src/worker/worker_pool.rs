//! # Worker Pool
//!
//! One polling loop per lane. Each loop reads up to `batch_size` messages with the
//! configured visibility timeout and processes them concurrently, bounded by a
//! per-lane semaphore of `concurrency` permits.
//!
//! Message disposition:
//!
//! - processed (completed, failed or already terminal) → ack
//! - retryable error (store or queue unavailable) → leave it; it reappears once the
//!   visibility timeout lapses
//! - malformed payload or non-retryable error → archive
//! - read more than `max_read_count` times → fail the unit, then archive
//!
//! Shutdown is cooperative: the loops stop reading, wait for in-flight units and exit.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::image_processor::ImageProcessor;
use crate::config::{QueueConfig, WorkerConfig};
use crate::error::Result;
use crate::logging::log_error;
use crate::messaging::{ImageUnitMessage, Lane, QueuedMessage, TaskQueue};

/// What happened to one queue message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Acked,
    Archived,
    /// Left on the queue for redelivery
    Retained,
}

#[derive(Debug)]
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    processor: Arc<ImageProcessor>,
    queue_config: QueueConfig,
    concurrency: usize,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        processor: Arc<ImageProcessor>,
        queue_config: QueueConfig,
        worker_config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            queue_config,
            concurrency: worker_config.concurrency.max(1),
            shutdown_timeout: worker_config.shutdown_timeout(),
        }
    }

    /// Read one round of messages from `lane` and process them to completion.
    /// Returns the number of messages read.
    pub async fn poll_once(&self, lane: Lane) -> Result<usize> {
        let messages = self
            .queue
            .read(
                lane,
                self.queue_config.visibility_timeout(),
                self.queue_config.batch_size.min(self.concurrency),
            )
            .await?;
        let count = messages.len();

        futures::future::join_all(messages.iter().map(|m| self.handle_message(m))).await;
        Ok(count)
    }

    /// Process one message and settle it on the queue
    pub async fn handle_message(&self, message: &QueuedMessage) -> MessageDisposition {
        match self.try_handle(message).await {
            Ok(disposition) => disposition,
            Err(e) => {
                log_error(
                    "worker_pool",
                    "settle_message",
                    &e.to_string(),
                    Some(&format!("{} #{}", message.handle.lane, message.handle.message_id)),
                );
                MessageDisposition::Retained
            }
        }
    }

    async fn try_handle(&self, message: &QueuedMessage) -> Result<MessageDisposition> {
        let unit_message: ImageUnitMessage = match message.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    lane = %message.handle.lane,
                    message_id = message.handle.message_id,
                    error = %e,
                    "Archiving malformed message"
                );
                self.queue.archive(&message.handle, "malformed payload").await?;
                return Ok(MessageDisposition::Archived);
            }
        };

        if message.read_count > self.queue_config.max_read_count {
            let reason = format!("read {} times", message.read_count);
            match self.processor.abandon(&unit_message, &reason).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => warn!(
                    image_unit_uuid = %unit_message.image_unit_uuid,
                    error = %e,
                    "Could not fail abandoned unit"
                ),
            }
            self.queue.archive(&message.handle, &reason).await?;
            return Ok(MessageDisposition::Archived);
        }

        if message.is_redelivery() {
            debug!(
                image_unit_uuid = %unit_message.image_unit_uuid,
                read_count = message.read_count,
                "Processing redelivered message"
            );
        }

        match self.processor.process(&unit_message).await {
            Ok(_) => {
                self.queue.ack(&message.handle).await?;
                Ok(MessageDisposition::Acked)
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    image_unit_uuid = %unit_message.image_unit_uuid,
                    error = %e,
                    "Retryable failure; leaving message for redelivery"
                );
                Ok(MessageDisposition::Retained)
            }
            Err(e) => {
                error!(
                    image_unit_uuid = %unit_message.image_unit_uuid,
                    error = %e,
                    "Non-retryable failure; archiving message"
                );
                self.queue.archive(&message.handle, &e.to_string()).await?;
                Ok(MessageDisposition::Archived)
            }
        }
    }

    /// Spawn one polling loop per lane
    pub fn start(self: Arc<Self>, lanes: &[Lane]) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = lanes
            .iter()
            .map(|&lane| {
                let pool = Arc::clone(&self);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { pool.run_lane(lane, shutdown).await })
            })
            .collect();

        info!(
            lanes = ?lanes,
            concurrency = self.concurrency,
            "👷 Worker pool started"
        );
        WorkerPoolHandle {
            shutdown_tx,
            tasks,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    async fn run_lane(self: Arc<Self>, lane: Lane, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let poll_interval = self.queue_config.poll_interval();

        loop {
            // A dropped handle counts as a shutdown request
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            let available = permits.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => continue,
                    _ = shutdown.changed() => continue,
                }
            }

            let limit = self.queue_config.batch_size.min(available);
            let messages = match self
                .queue
                .read(lane, self.queue_config.visibility_timeout(), limit)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    log_error("worker_pool", "read", &e.to_string(), Some(lane.as_str()));
                    Vec::new()
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for message in messages {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let pool = Arc::clone(&self);
                tokio::spawn(async move {
                    pool.handle_message(&message).await;
                    drop(permit);
                });
            }
        }

        // Drain in-flight units before reporting the lane stopped
        let concurrency = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let _ = permits.acquire_many(concurrency).await;
        info!(lane = %lane, "Worker lane stopped");
    }
}

/// Controls a started [`WorkerPool`]
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl WorkerPoolHandle {
    /// Stop reading and wait for in-flight units, up to the shutdown timeout
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let joined = tokio::time::timeout(
            self.shutdown_timeout,
            futures::future::join_all(self.tasks),
        )
        .await;

        if joined.is_err() {
            warn!(
                timeout_seconds = self.shutdown_timeout.as_secs(),
                "Worker pool did not drain before the shutdown timeout"
            );
        } else {
            info!("Worker pool stopped");
        }
    }
}
