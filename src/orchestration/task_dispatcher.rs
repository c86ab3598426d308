//! # Task Dispatcher
//!
//! Turns a persisted batch into queued unit tasks, one message per image unit, routed to
//! a lane by [`LaneSelector`].
//!
//! Ordering:
//!
//! 1. `start_dispatch` flips the batch `pending → processing`. A batch that already left
//!    `pending` is not dispatched twice.
//! 2. Every unit is submitted to its lane.
//! 3. The handles are registered against the batch.
//!
//! The status flip comes first so a fast worker can never drain the barrier while the
//! batch still reads `pending`. If submission fails part way, the error propagates and
//! the unsubmitted units stay `pending`; the unit reconciler re-submits them once they
//! go stale.
//!
//! A batch with no units has nothing to wait for and is released straight to the
//! finalizer.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::batch_finalizer::FinalizationResult;
use super::completion_barrier::CompletionBarrier;
use crate::constants::events;
use crate::error::Result;
use crate::events::{EventPublisher, LifecycleEvent};
use crate::logging::log_batch_operation;
use crate::messaging::{
    submit_message, DispatchRegistration, EnqueueReason, ImageUnitMessage, Lane, TaskQueue,
};
use crate::models::{Batch, ImageUnit};
use crate::state_machine::BatchState;
use crate::store::BatchStore;

/// Chooses the lane for a unit. Lane choice affects fairness only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneSelector {
    pass_through: bool,
}

impl LaneSelector {
    /// `pass_through` is true when the configured transform leaves pixels untouched
    pub fn new(pass_through: bool) -> Self {
        Self { pass_through }
    }

    pub fn lane_for(&self, _unit: &ImageUnit) -> Lane {
        if self.pass_through {
            Lane::Fast
        } else {
            Lane::Image
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched(DispatchRegistration),
    /// Zero units; finalized without touching the queue
    Empty(FinalizationResult),
    /// The batch had already left `pending`
    AlreadyDispatched,
}

#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    store: Arc<dyn BatchStore>,
    queue: Arc<dyn TaskQueue>,
    barrier: Arc<CompletionBarrier>,
    lanes: LaneSelector,
    publisher: EventPublisher,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn BatchStore>,
        queue: Arc<dyn TaskQueue>,
        barrier: Arc<CompletionBarrier>,
        lanes: LaneSelector,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            queue,
            barrier,
            lanes,
            publisher,
        }
    }

    #[instrument(skip(self, batch), fields(batch_uuid = %batch.batch_uuid))]
    pub async fn dispatch(&self, batch: &Batch) -> Result<DispatchOutcome> {
        if batch.status != BatchState::Pending {
            debug!(status = %batch.status, "Batch is not pending; skipping dispatch");
            return Ok(DispatchOutcome::AlreadyDispatched);
        }

        if batch.expected_total == 0 {
            info!("Batch has no image units; finalizing immediately");
            let finalization = self.barrier.release_empty(batch.batch_uuid).await?;
            return Ok(DispatchOutcome::Empty(finalization));
        }

        let dispatched_at = Utc::now();
        if !self
            .store
            .start_dispatch(batch.batch_uuid, dispatched_at)
            .await?
        {
            warn!("Batch was dispatched concurrently");
            return Ok(DispatchOutcome::AlreadyDispatched);
        }

        let units = self.store.list_units(batch.batch_uuid).await?;
        let mut handles = Vec::with_capacity(units.len());
        let (mut fast, mut image) = (0usize, 0usize);
        for unit in &units {
            let lane = self.lanes.lane_for(unit);
            let message = ImageUnitMessage::for_unit(unit, lane, EnqueueReason::Dispatch);
            handles.push(submit_message(self.queue.as_ref(), lane, &message).await?);
            match lane {
                Lane::Fast => fast += 1,
                Lane::Image => image += 1,
            }
        }

        let registration = DispatchRegistration {
            batch_uuid: batch.batch_uuid,
            handles,
            dispatched_at,
        };
        self.store.register_dispatch(&registration).await?;

        log_batch_operation(
            "dispatch",
            batch.batch_uuid,
            BatchState::Processing.as_str(),
            Some(&format!("{} tasks ({fast} fast, {image} image)", units.len())),
        );
        self.publisher.publish(LifecycleEvent::batch(
            events::BATCH_DISPATCHED,
            batch.batch_uuid,
            json!({
                "tasks": registration.handles.len(),
                "fast": fast,
                "image": image,
            }),
        ));

        Ok(DispatchOutcome::Dispatched(registration))
    }
}
