//! # Image Processor
//!
//! Executes one unit task end to end:
//!
//! 1. load the unit; a unit already in a terminal state is re-reported and skipped
//! 2. claim it `pending → processing` (a `processing` unit is a redelivery and resumes)
//! 3. fetch the source image
//! 4. transform it on the blocking pool
//! 5. persist the output and record `completed` with its URL
//! 6. report the terminal outcome to the completion barrier
//!
//! Failures in steps 3–5 fail this unit only. Store and queue failures propagate so
//! the message is redelivered.
//!
//! Re-reporting a terminal unit is idempotent at the barrier. It covers a worker that
//! crashed between recording the outcome and reporting it.

use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::fetcher::SourceFetcher;
use super::output_store::OutputStore;
use super::transform::{ImageTransform, TransformedImage};
use crate::error::{ImageBatchError, ProcessingError, Result, TransformError};
use crate::logging::log_unit_operation;
use crate::messaging::ImageUnitMessage;
use crate::models::{ImageUnit, UnitReport};
use crate::orchestration::{BarrierOutcome, CompletionBarrier};
use crate::state_machine::{StateMachineError, UnitEvent, UnitState, UnitStateMachine};
use crate::store::BatchStore;

/// Compare-and-set retries before giving up on a contended unit
const MAX_CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Completed {
        output_url: String,
        barrier: BarrierOutcome,
    },
    Failed {
        error: String,
        barrier: BarrierOutcome,
    },
    /// The unit was terminal before this task ran
    AlreadyTerminal {
        status: UnitState,
        barrier: BarrierOutcome,
    },
}

impl ProcessingOutcome {
    pub fn barrier(&self) -> &BarrierOutcome {
        match self {
            Self::Completed { barrier, .. }
            | Self::Failed { barrier, .. }
            | Self::AlreadyTerminal { barrier, .. } => barrier,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageProcessor {
    store: Arc<dyn BatchStore>,
    state_machine: UnitStateMachine,
    fetcher: Arc<dyn SourceFetcher>,
    transform: Arc<dyn ImageTransform>,
    output_store: Arc<dyn OutputStore>,
    barrier: Arc<CompletionBarrier>,
}

fn is_concurrent_modification(err: &ImageBatchError) -> bool {
    matches!(
        err,
        ImageBatchError::StateMachine(StateMachineError::ConcurrentModification { .. })
    )
}

impl ImageProcessor {
    pub fn new(
        store: Arc<dyn BatchStore>,
        state_machine: UnitStateMachine,
        fetcher: Arc<dyn SourceFetcher>,
        transform: Arc<dyn ImageTransform>,
        output_store: Arc<dyn OutputStore>,
        barrier: Arc<CompletionBarrier>,
    ) -> Self {
        Self {
            store,
            state_machine,
            fetcher,
            transform,
            output_store,
            barrier,
        }
    }

    #[instrument(skip(self, message), fields(
        batch_uuid = %message.batch_uuid,
        image_unit_uuid = %message.image_unit_uuid,
    ))]
    pub async fn process(&self, message: &ImageUnitMessage) -> Result<ProcessingOutcome> {
        let Some(unit) = self.claim(message.image_unit_uuid).await? else {
            let unit = self.load(message.image_unit_uuid).await?;
            return self.report_existing(&unit).await;
        };

        let event = match self.produce(&unit).await {
            Ok(output_url) => UnitEvent::Complete(output_url),
            Err(e) => {
                warn!(error_code = e.error_code(), error = %e, "Image unit failed");
                UnitEvent::Fail(e.to_string())
            }
        };

        let status = match self.state_machine.transition(&unit, event.clone()).await {
            Ok(status) => status,
            Err(e) if is_concurrent_modification(&e) => {
                // Another delivery of the same task finished first
                let current = self.load(unit.image_unit_uuid).await?;
                return self.report_existing(&current).await;
            }
            Err(e) => return Err(e),
        };

        let report = match &event {
            UnitEvent::Fail(error) => UnitReport::failed(unit.batch_uuid, unit.image_unit_uuid, error),
            _ => UnitReport::completed(unit.batch_uuid, unit.image_unit_uuid),
        };
        let barrier = self.barrier.report(&report).await?;

        log_unit_operation(
            "process",
            unit.batch_uuid,
            unit.image_unit_uuid,
            status.as_str(),
            event.error_message(),
        );

        Ok(match event {
            UnitEvent::Complete(output_url) => ProcessingOutcome::Completed {
                output_url,
                barrier,
            },
            UnitEvent::Fail(error) => ProcessingOutcome::Failed { error, barrier },
            UnitEvent::Start => ProcessingOutcome::AlreadyTerminal { status, barrier },
        })
    }

    /// Fail a unit whose task will not be retried again and report it, so its batch
    /// can still drain. A unit that is already terminal is re-reported unchanged.
    pub async fn abandon(&self, message: &ImageUnitMessage, reason: &str) -> Result<ProcessingOutcome> {
        let Some(unit) = self.claim(message.image_unit_uuid).await? else {
            let unit = self.load(message.image_unit_uuid).await?;
            return self.report_existing(&unit).await;
        };

        let error = format!("abandoned: {reason}");
        match self
            .state_machine
            .transition(&unit, UnitEvent::Fail(error.clone()))
            .await
        {
            Ok(_) => {}
            Err(e) if is_concurrent_modification(&e) => {
                let current = self.load(unit.image_unit_uuid).await?;
                return self.report_existing(&current).await;
            }
            Err(e) => return Err(e),
        }

        warn!(reason = %reason, "Image unit abandoned");
        let report = UnitReport::failed(unit.batch_uuid, unit.image_unit_uuid, &error);
        let barrier = self.barrier.report(&report).await?;
        Ok(ProcessingOutcome::Failed { error, barrier })
    }

    async fn load(&self, image_unit_uuid: Uuid) -> Result<ImageUnit> {
        self.store
            .find_unit(image_unit_uuid)
            .await?
            .ok_or(ImageBatchError::UnitNotFound(image_unit_uuid))
    }

    /// Move the unit into `processing`. Returns `None` when the unit is already terminal.
    async fn claim(&self, image_unit_uuid: Uuid) -> Result<Option<ImageUnit>> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let mut unit = self.load(image_unit_uuid).await?;
            match unit.status {
                UnitState::Completed | UnitState::Failed => return Ok(None),
                UnitState::Processing => {
                    debug!(attempts = unit.attempts, "Resuming unit already in processing");
                    return Ok(Some(unit));
                }
                UnitState::Pending => {}
            }

            match self.state_machine.transition(&unit, UnitEvent::Start).await {
                Ok(status) => {
                    unit.status = status;
                    unit.attempts += 1;
                    return Ok(Some(unit));
                }
                Err(e) if is_concurrent_modification(&e) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(ImageBatchError::Internal(format!(
            "unit {image_unit_uuid} kept changing while being claimed"
        )))
    }

    async fn report_existing(&self, unit: &ImageUnit) -> Result<ProcessingOutcome> {
        let report = UnitReport::from_terminal_unit(unit).ok_or_else(|| {
            ImageBatchError::Internal(format!(
                "unit {} is {} after a concurrent write",
                unit.image_unit_uuid, unit.status
            ))
        })?;

        debug!(status = %unit.status, "Unit already terminal; re-reporting");
        let barrier = self.barrier.report(&report).await?;
        Ok(ProcessingOutcome::AlreadyTerminal {
            status: unit.status,
            barrier,
        })
    }

    /// Fetch, transform and store. Every error here belongs to this unit alone.
    async fn produce(&self, unit: &ImageUnit) -> std::result::Result<String, ProcessingError> {
        let fetched = self.fetcher.fetch(&unit.source_url).await?;

        let transform = Arc::clone(&self.transform);
        let input = fetched.bytes.clone();
        let transformed: TransformedImage =
            tokio::task::spawn_blocking(move || transform.apply(&input))
                .await
                .map_err(|e| TransformError::Encode(format!("transform task aborted: {e}")))??;

        let key = format!(
            "{}/{}.{}",
            unit.batch_uuid, unit.image_unit_uuid, transformed.extension
        );
        self.output_store
            .put(&key, &transformed.bytes, transformed.content_type)
            .await
    }
}
