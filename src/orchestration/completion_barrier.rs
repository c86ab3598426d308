//! # Completion Barrier
//!
//! Fan-in for a batch's units. Every unit reports its terminal outcome here; the store
//! records the report and decrements the batch counter in one atomic step
//! ([`BatchStore::record_report`]). Exactly one report observes the counter reaching
//! zero, and that caller invokes the finalizer.
//!
//! A second report for the same unit is recognised as a duplicate before the counter is
//! touched. This is what makes queue redelivery and reconciler re-submission safe.
//!
//! The counter reaches zero in its own commit, before the finalizer runs. If the
//! finalizer then fails, the releasing report's error sends its task back to the queue.
//! The redelivered report is a duplicate, so instead of doing nothing it checks for a
//! drained batch that never committed finalization and runs the finalizer again
//! ([`CompletionBarrier::recover`]).
//!
//! The barrier does not time units out. Liveness for lost tasks comes from queue
//! visibility timeouts and the optional [`super::unit_reconciler`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batch_finalizer::{BatchFinalizer, FinalizationResult};
use crate::constants::events;
use crate::error::{ImageBatchError, Result};
use crate::events::{EventPublisher, LifecycleEvent};
use crate::models::{ReportOutcome, UnitReport};
use crate::store::BatchStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "barrier", rename_all = "snake_case")]
pub enum BarrierOutcome {
    /// The unit had already reported and the batch needed nothing more
    DuplicateReport,
    /// Counted; other units are still outstanding
    Pending { remaining: i64 },
    /// This report drained the batch, or found it drained but unfinalized, and the
    /// finalizer ran
    Released { finalization: FinalizationResult },
}

#[derive(Debug, Clone)]
pub struct CompletionBarrier {
    store: Arc<dyn BatchStore>,
    finalizer: Arc<BatchFinalizer>,
    publisher: EventPublisher,
}

impl CompletionBarrier {
    pub fn new(
        store: Arc<dyn BatchStore>,
        finalizer: Arc<BatchFinalizer>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            finalizer,
            publisher,
        }
    }

    pub async fn report(&self, report: &UnitReport) -> Result<BarrierOutcome> {
        if !report.status.is_terminal() {
            return Err(ImageBatchError::Internal(format!(
                "unit {} reported non-terminal status {}",
                report.image_unit_uuid, report.status
            )));
        }

        match self.store.record_report(report).await? {
            ReportOutcome::Duplicate => {
                debug!(
                    batch_uuid = %report.batch_uuid,
                    image_unit_uuid = %report.image_unit_uuid,
                    "Duplicate unit report"
                );
                match self.recover(report.batch_uuid).await? {
                    Some(finalization @ FinalizationResult::Finalized(_)) => {
                        Ok(BarrierOutcome::Released { finalization })
                    }
                    _ => Ok(BarrierOutcome::DuplicateReport),
                }
            }
            ReportOutcome::Pending { remaining } => {
                debug!(
                    batch_uuid = %report.batch_uuid,
                    remaining = remaining,
                    "Unit report counted"
                );
                Ok(BarrierOutcome::Pending { remaining })
            }
            ReportOutcome::Released => {
                let finalization = self.release(report.batch_uuid).await?;
                Ok(BarrierOutcome::Released { finalization })
            }
        }
    }

    /// Release a batch that has no units to wait for
    pub async fn release_empty(&self, batch_uuid: Uuid) -> Result<FinalizationResult> {
        self.release(batch_uuid).await
    }

    /// Run the finalizer again for a batch whose counter reached zero but whose
    /// finalization never committed. `None` when the batch is still counting down or
    /// already finalized.
    pub async fn recover(&self, batch_uuid: Uuid) -> Result<Option<FinalizationResult>> {
        let Some(batch) = self.store.find_batch(batch_uuid).await? else {
            return Ok(None);
        };
        if !batch.is_drained() || batch.finalized_at.is_some() {
            return Ok(None);
        }

        warn!(batch_uuid = %batch_uuid, "Drained batch was never finalized; releasing again");
        self.release(batch_uuid).await.map(Some)
    }

    async fn release(&self, batch_uuid: Uuid) -> Result<FinalizationResult> {
        info!(batch_uuid = %batch_uuid, "🚧 Completion barrier released");
        self.publisher.publish(LifecycleEvent::batch(
            events::BARRIER_RELEASED,
            batch_uuid,
            json!({}),
        ));

        let outcomes = self.store.list_reports(batch_uuid).await?;
        self.finalizer.finalize(batch_uuid, &outcomes).await
    }
}
