//! # Batch Store
//!
//! The durable-store seam. Every component receives an `Arc<dyn BatchStore>` at
//! construction; none of them reach for a global connection.
//!
//! Two operations carry the concurrency guarantees of the whole system:
//!
//! - [`BatchStore::transition_unit`] is a compare-and-set on a unit's status, which is
//!   what keeps each unit single-writer.
//! - [`BatchStore::record_report`] inserts a unit's terminal report if absent and
//!   decrements the batch counter in the same atomic step. A repeat report for the same
//!   unit changes nothing.
//! - [`BatchStore::commit_finalization`] writes the terminal status together with the
//!   `finalized_at` marker, so a batch is either finalized or still open for a retry.
//!
//! [`PostgresBatchStore`] implements these with single SQL statements inside one
//! transaction; [`InMemoryBatchStore`] serialises them behind a per-batch lock.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::messaging::DispatchRegistration;
use crate::models::{
    Batch, BatchCompletion, ImageUnit, NewBatch, Product, ReportOutcome, UnitCounts,
    UnitReport, UnitTransition,
};

pub use in_memory::InMemoryBatchStore;
pub use postgres::PostgresBatchStore;

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[async_trait]
pub trait BatchStore: Send + Sync + std::fmt::Debug {
    /// Write the batch, its products and units, the expected total and the barrier
    /// counter in one atomic step.
    async fn create_batch(&self, batch: &NewBatch) -> PersistenceResult<Batch>;

    async fn find_batch(&self, batch_uuid: Uuid) -> PersistenceResult<Option<Batch>>;

    /// Move the batch `pending → processing` before any task is submitted. Returns
    /// `false` if the batch had already left `pending`.
    async fn start_dispatch(
        &self,
        batch_uuid: Uuid,
        dispatched_at: DateTime<Utc>,
    ) -> PersistenceResult<bool>;

    /// Record the full set of task handles submitted for a batch
    async fn register_dispatch(&self, registration: &DispatchRegistration)
        -> PersistenceResult<()>;

    async fn find_unit(&self, image_unit_uuid: Uuid) -> PersistenceResult<Option<ImageUnit>>;

    /// Compare-and-set a unit's status. Returns `false` when the unit was not in
    /// `transition.from`.
    async fn transition_unit(&self, transition: &UnitTransition) -> PersistenceResult<bool>;

    /// Atomic report-and-decrement for the completion barrier.
    async fn record_report(&self, report: &UnitReport) -> PersistenceResult<ReportOutcome>;

    async fn list_reports(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<UnitReport>>;

    /// Write the terminal status and output artifact and stamp `finalized_at`, in one
    /// step, only if the batch has not been finalized yet. Returns `true` for exactly one
    /// caller per batch; a finalizer that fails before this point leaves the batch open
    /// for another attempt.
    async fn commit_finalization(&self, completion: &BatchCompletion)
        -> PersistenceResult<bool>;

    async fn record_delivery_error(
        &self,
        batch_uuid: Uuid,
        error: Option<&str>,
    ) -> PersistenceResult<()>;

    /// Products of a batch in submission order
    async fn list_products(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<Product>>;

    /// Units of a batch, ordered by product then creation
    async fn list_units(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<ImageUnit>>;

    async fn count_units(&self, batch_uuid: Uuid) -> PersistenceResult<UnitCounts>;

    /// Non-terminal units of `processing` batches not updated since `older_than`
    async fn find_stale_units(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> PersistenceResult<Vec<ImageUnit>>;

    /// Unfinalized batches not updated since `older_than` that cannot move on their own:
    /// `pending` batches whose dispatch never ran, and drained `processing` batches whose
    /// finalization never committed.
    async fn find_stalled_batches(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> PersistenceResult<Vec<Batch>>;

    /// Bump a unit's `updated_at` without changing anything else
    async fn touch_unit(&self, image_unit_uuid: Uuid) -> PersistenceResult<()>;
}
