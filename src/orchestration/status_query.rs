//! Read-only batch progress.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ImageBatchError, Result};
use crate::models::UnitCounts;
use crate::state_machine::BatchState;
use crate::store::BatchStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_uuid: Uuid,
    pub status: BatchState,
    pub expected_total: i64,
    pub terminal_units: i64,
    pub completed_units: i64,
    pub failed_units: i64,
    /// Terminal units over expected total, in [0, 100]
    pub percentage: f64,
}

/// Terminal over expected as a percentage, clamped; an empty batch is complete
pub fn progress_percentage(terminal: i64, expected_total: i64) -> f64 {
    if expected_total <= 0 {
        return 100.0;
    }
    (terminal as f64 / expected_total as f64 * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone)]
pub struct StatusQuery {
    store: Arc<dyn BatchStore>,
}

impl StatusQuery {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, batch_uuid: Uuid) -> Result<BatchProgress> {
        let batch = self
            .store
            .find_batch(batch_uuid)
            .await?
            .ok_or(ImageBatchError::NotFound(batch_uuid))?;
        let counts: UnitCounts = self.store.count_units(batch_uuid).await?;

        Ok(BatchProgress {
            batch_uuid,
            status: batch.status,
            expected_total: batch.expected_total,
            terminal_units: counts.terminal(),
            completed_units: counts.completed,
            failed_units: counts.failed,
            percentage: progress_percentage(counts.terminal(), batch.expected_total),
        })
    }
}
