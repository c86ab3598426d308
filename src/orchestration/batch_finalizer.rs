//! # Batch Finalizer
//!
//! Runs after the completion barrier releases. It reads back products and units, builds
//! the export rows, renders the CSV and persists it through the [`OutputStore`], then
//! decides the terminal status with the [`CompletionPolicy`].
//!
//! Status, output artifact and the `finalized_at` marker are written together by
//! [`BatchStore::commit_finalization`]. Exactly one invocation per batch gets past that
//! commit; any other returns [`FinalizationResult::AlreadyFinalized`]. An invocation that
//! fails before committing leaves the batch open, so a redelivered report or the
//! reconciler can run the finalizer again. The export key is derived from the batch id,
//! so a repeated attempt overwrites the same artifact.
//!
//! Delivery to [`ResultDelivery`] runs only after the commit. A failed delivery is
//! recorded on the batch and returned in the result; the status stands.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::completion_policy::{CompletionPolicy, OutcomeSummary};
use super::export::{build_export_rows, render_csv};
use super::result_delivery::{DeliveryOutcome, DeliveryPayload, ResultDelivery};
use crate::constants::{events, EXPORT_CONTENT_TYPE};
use crate::error::{ImageBatchError, Result};
use crate::events::{EventPublisher, LifecycleEvent};
use crate::logging::{log_batch_operation, log_error};
use crate::models::{BatchCompletion, UnitReport};
use crate::state_machine::{determine_batch_target, BatchEvent, BatchState};
use crate::store::BatchStore;
use crate::worker::OutputStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizationReport {
    pub batch_uuid: Uuid,
    pub status: BatchState,
    pub summary: OutcomeSummary,
    pub export_rows: usize,
    pub file_name: String,
    pub output_artifact: Option<String>,
    pub delivery: DeliveryOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FinalizationResult {
    Finalized(FinalizationReport),
    /// Another invocation already committed this batch
    AlreadyFinalized { batch_uuid: Uuid },
}

impl FinalizationResult {
    pub fn report(&self) -> Option<&FinalizationReport> {
        match self {
            Self::Finalized(report) => Some(report),
            Self::AlreadyFinalized { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchFinalizer {
    store: Arc<dyn BatchStore>,
    output_store: Arc<dyn OutputStore>,
    delivery: Option<Arc<dyn ResultDelivery>>,
    policy: CompletionPolicy,
    publisher: EventPublisher,
}

impl BatchFinalizer {
    pub fn new(
        store: Arc<dyn BatchStore>,
        output_store: Arc<dyn OutputStore>,
        delivery: Option<Arc<dyn ResultDelivery>>,
        policy: CompletionPolicy,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            output_store,
            delivery,
            policy,
            publisher,
        }
    }

    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    pub async fn finalize(
        &self,
        batch_uuid: Uuid,
        outcomes: &[UnitReport],
    ) -> Result<FinalizationResult> {
        let batch = self
            .store
            .find_batch(batch_uuid)
            .await?
            .ok_or(ImageBatchError::NotFound(batch_uuid))?;

        if batch.finalized_at.is_some() {
            debug!(batch_uuid = %batch_uuid, "Batch already finalized");
            return Ok(FinalizationResult::AlreadyFinalized { batch_uuid });
        }

        let products = self.store.list_products(batch_uuid).await?;
        let units = self.store.list_units(batch_uuid).await?;
        let rows = build_export_rows(&products, &units);
        let artifact = render_csv(&rows)
            .map_err(|e| ImageBatchError::Internal(format!("export rendering failed: {e}")))?;

        let file_name = format!("{batch_uuid}.csv");
        let output_artifact = match self
            .output_store
            .put(
                &format!("{batch_uuid}/{file_name}"),
                &artifact,
                EXPORT_CONTENT_TYPE,
            )
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                log_error(
                    "batch_finalizer",
                    "persist_export",
                    &e.to_string(),
                    Some(&batch_uuid.to_string()),
                );
                None
            }
        };

        let summary = OutcomeSummary::from_reports(outcomes);
        let decided = self.policy.decide(&summary);
        let status = determine_batch_target(
            batch.status,
            BatchEvent::Finalize(decided == BatchState::Completed),
        )?;

        let committed = self
            .store
            .commit_finalization(&BatchCompletion {
                batch_uuid,
                status,
                output_artifact: output_artifact.clone(),
            })
            .await?;
        if !committed {
            debug!(batch_uuid = %batch_uuid, "Concurrent finalization committed first");
            return Ok(FinalizationResult::AlreadyFinalized { batch_uuid });
        }

        log_batch_operation(
            "finalize",
            batch_uuid,
            status.as_str(),
            Some(&format!(
                "{} succeeded, {} failed, {} rows",
                summary.succeeded,
                summary.failed,
                rows.len()
            )),
        );
        self.publisher.publish(LifecycleEvent::batch(
            events::BATCH_FINALIZED,
            batch_uuid,
            json!({
                "status": status,
                "succeeded": summary.succeeded,
                "failed": summary.failed,
                "output_artifact": output_artifact,
            }),
        ));

        let payload = DeliveryPayload {
            batch_id: batch_uuid,
            status,
            file_name: file_name.clone(),
            content_type: EXPORT_CONTENT_TYPE.to_string(),
            artifact: String::from_utf8_lossy(&artifact).into_owned(),
            artifact_url: output_artifact.clone(),
        };
        let delivery = self.deliver(&payload).await?;

        Ok(FinalizationResult::Finalized(FinalizationReport {
            batch_uuid,
            status,
            summary,
            export_rows: rows.len(),
            file_name,
            output_artifact,
            delivery,
        }))
    }

    async fn deliver(&self, payload: &DeliveryPayload) -> Result<DeliveryOutcome> {
        let Some(delivery) = &self.delivery else {
            info!(batch_uuid = %payload.batch_id, "No delivery target configured");
            return Ok(DeliveryOutcome::Skipped);
        };

        match delivery.deliver(payload).await {
            Ok(()) => Ok(DeliveryOutcome::Delivered),
            Err(e) => {
                let message = e.to_string();
                error!(
                    batch_uuid = %payload.batch_id,
                    error = %message,
                    "Delivery failed; batch status unchanged"
                );
                self.store
                    .record_delivery_error(payload.batch_id, Some(&message))
                    .await?;
                self.publisher.publish(LifecycleEvent::batch(
                    events::DELIVERY_FAILED,
                    payload.batch_id,
                    json!({ "error": message }),
                ));
                Ok(DeliveryOutcome::Failed(message))
            }
        }
    }
}
