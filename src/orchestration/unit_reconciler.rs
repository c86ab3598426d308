//! # Unit Reconciler
//!
//! Periodic sweep for work that lost its driver.
//!
//! - Units whose task was lost: non-terminal units of `processing` batches that have not
//!   been touched for longer than the stale threshold. Each one is re-submitted to its
//!   lane and touched so the next sweep leaves it alone until it goes stale again.
//! - Batches that stalled between steps: `pending` batches whose dispatch failed after
//!   intake committed are dispatched again, and drained batches whose finalization never
//!   committed are released to the finalizer again.
//!
//! Re-submission is safe because workers skip terminal units and the completion barrier
//! ignores duplicate reports. A unit whose original task is merely slow gets processed
//! at most once more; the compare-and-set on its status keeps the outcome single.
//! Dispatch and finalization are guarded the same way by `start_dispatch` and
//! `commit_finalization`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::completion_barrier::CompletionBarrier;
use super::task_dispatcher::{LaneSelector, TaskDispatcher};
use crate::config::ReconciliationConfig;
use crate::constants::events;
use crate::error::{ImageBatchError, Result};
use crate::events::{EventPublisher, LifecycleEvent};
use crate::logging::log_error;
use crate::messaging::{submit_message, EnqueueReason, ImageUnitMessage, TaskQueue};
use crate::models::Batch;
use crate::state_machine::BatchState;
use crate::store::BatchStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Stale units found
    pub examined: usize,
    pub resubmitted: usize,
    /// Pending batches dispatched again
    pub redispatched: usize,
    /// Drained batches handed to the finalizer again
    pub refinalized: usize,
}

#[derive(Debug, Clone)]
pub struct UnitReconciler {
    store: Arc<dyn BatchStore>,
    queue: Arc<dyn TaskQueue>,
    lanes: LaneSelector,
    dispatcher: TaskDispatcher,
    barrier: Arc<CompletionBarrier>,
    publisher: EventPublisher,
    config: ReconciliationConfig,
}

impl UnitReconciler {
    pub fn new(
        store: Arc<dyn BatchStore>,
        queue: Arc<dyn TaskQueue>,
        lanes: LaneSelector,
        dispatcher: TaskDispatcher,
        barrier: Arc<CompletionBarrier>,
        publisher: EventPublisher,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            queue,
            lanes,
            dispatcher,
            barrier,
            publisher,
            config,
        }
    }

    /// One pass over stalled batches, then stale units
    pub async fn sweep(&self) -> Result<ReconcileSummary> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after())
            .map_err(|e| ImageBatchError::Internal(format!("stale threshold out of range: {e}")))?;
        let older_than = Utc::now() - stale_after;
        let mut summary = ReconcileSummary::default();

        let stalled = self
            .store
            .find_stalled_batches(older_than, self.config.batch_limit)
            .await?;
        for batch in &stalled {
            // One stuck batch must not block the others
            if let Err(e) = self.recover_batch(batch, &mut summary).await {
                log_error(
                    "unit_reconciler",
                    "recover_batch",
                    &e.to_string(),
                    Some(&batch.batch_uuid.to_string()),
                );
            }
        }

        let stale = self
            .store
            .find_stale_units(older_than, self.config.batch_limit)
            .await?;
        summary.examined = stale.len();

        for unit in &stale {
            let lane = self.lanes.lane_for(unit);
            let message = ImageUnitMessage::for_unit(unit, lane, EnqueueReason::Reconcile);
            submit_message(self.queue.as_ref(), lane, &message).await?;
            self.store.touch_unit(unit.image_unit_uuid).await?;
            summary.resubmitted += 1;

            debug!(
                batch_uuid = %unit.batch_uuid,
                image_unit_uuid = %unit.image_unit_uuid,
                status = %unit.status,
                lane = %lane,
                "Stale unit re-submitted"
            );
            self.publisher.publish(LifecycleEvent::unit(
                events::UNIT_REQUEUED,
                unit.batch_uuid,
                unit.image_unit_uuid,
                json!({ "lane": lane, "status": unit.status }),
            ));
        }

        if summary.resubmitted + summary.redispatched + summary.refinalized > 0 {
            info!(
                examined = summary.examined,
                resubmitted = summary.resubmitted,
                redispatched = summary.redispatched,
                refinalized = summary.refinalized,
                "🔁 Reconciliation sweep recovered stalled work"
            );
        }
        Ok(summary)
    }

    async fn recover_batch(&self, batch: &Batch, summary: &mut ReconcileSummary) -> Result<()> {
        if batch.status == BatchState::Pending {
            warn!(batch_uuid = %batch.batch_uuid, "Batch never dispatched; dispatching again");
            self.dispatcher.dispatch(batch).await?;
            summary.redispatched += 1;
        } else if self.barrier.recover(batch.batch_uuid).await?.is_some() {
            summary.refinalized += 1;
        }
        Ok(())
    }

    /// Sweep every interval until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_seconds = self.config.interval_seconds,
            stale_after_seconds = self.config.stale_after_seconds,
            "Unit reconciler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        log_error("unit_reconciler", "sweep", &e.to_string(), None);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Unit reconciler stopped");
    }
}
