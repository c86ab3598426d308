//! In-process [`BatchStore`] for tests and single-process runs.
//!
//! Each batch lives behind its own `parking_lot::Mutex`, which is the critical section
//! for the barrier's report-and-decrement. Units sit in a separate `DashMap` so unit
//! transitions from different workers never contend on the batch lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{BatchStore, PersistenceResult};
use crate::error::PersistenceError;
use crate::messaging::{DispatchRegistration, TaskHandle};
use crate::models::{
    Batch, BatchCompletion, ImageUnit, NewBatch, Product, ReportOutcome, UnitCounts,
    UnitReport, UnitTransition,
};
use crate::state_machine::{BatchState, UnitState};

#[derive(Debug)]
struct BatchRecord {
    batch: Batch,
    products: Vec<Product>,
    unit_ids: Vec<Uuid>,
    task_handles: Vec<TaskHandle>,
    reports: HashMap<Uuid, UnitReport>,
}

#[derive(Debug)]
pub struct InMemoryBatchStore {
    batches: DashMap<Uuid, Arc<Mutex<BatchRecord>>>,
    units: DashMap<Uuid, ImageUnit>,
    available: AtomicBool,
    fail_next: Mutex<HashSet<&'static str>>,
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self {
            batches: DashMap::new(),
            units: DashMap::new(),
            available: AtomicBool::new(true),
            fail_next: Mutex::new(HashSet::new()),
        }
    }
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`PersistenceError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Task handles registered by the dispatcher for a batch
    pub fn task_handles(&self, batch_uuid: Uuid) -> Vec<TaskHandle> {
        self.batches
            .get(&batch_uuid)
            .map(|record| record.lock().task_handles.clone())
            .unwrap_or_default()
    }

    /// Rewind a unit's `updated_at`, for exercising stale-unit detection
    pub fn backdate_unit(&self, image_unit_uuid: Uuid, updated_at: DateTime<Utc>) {
        if let Some(mut unit) = self.units.get_mut(&image_unit_uuid) {
            unit.updated_at = updated_at;
        }
    }

    /// Fail the next call of the named [`BatchStore`] method (for example
    /// `"list_reports"`) with [`PersistenceError::Unavailable`]; later calls succeed.
    pub fn fail_next(&self, operation: &'static str) {
        self.fail_next.lock().insert(operation);
    }

    /// Rewind a batch's `updated_at`, for exercising stalled-batch detection
    pub fn backdate_batch(&self, batch_uuid: Uuid, updated_at: DateTime<Utc>) {
        if let Some(record) = self.batches.get(&batch_uuid) {
            record.lock().batch.updated_at = updated_at;
        }
    }

    fn check(&self, operation: &'static str) -> PersistenceResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        if self.fail_next.lock().remove(operation) {
            return Err(PersistenceError::Unavailable(format!(
                "injected failure in {operation}"
            )));
        }
        Ok(())
    }

    fn record(&self, batch_uuid: Uuid) -> PersistenceResult<Arc<Mutex<BatchRecord>>> {
        self.batches
            .get(&batch_uuid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(PersistenceError::MissingRecord {
                entity: "batch",
                id: batch_uuid,
            })
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn create_batch(&self, new_batch: &NewBatch) -> PersistenceResult<Batch> {
        self.check("create_batch")?;
        let now = Utc::now();
        let expected_total = new_batch.expected_total();

        let batch = Batch {
            batch_uuid: new_batch.batch_uuid,
            status: BatchState::Pending,
            expected_total,
            remaining_units: expected_total,
            input_artifact: new_batch.input_artifact.clone(),
            output_artifact: None,
            delivery_error: None,
            dispatched_at: None,
            finalized_at: None,
            created_at: now,
            updated_at: now,
        };

        let products = new_batch
            .products
            .iter()
            .map(|p| Product {
                product_uuid: p.product_uuid,
                batch_uuid: new_batch.batch_uuid,
                serial: p.serial,
                name: p.name.clone(),
                position: p.position,
                created_at: now,
            })
            .collect();

        let mut unit_ids = Vec::with_capacity(expected_total as usize);
        for (product, unit) in new_batch.units() {
            unit_ids.push(unit.image_unit_uuid);
            self.units.insert(
                unit.image_unit_uuid,
                ImageUnit {
                    image_unit_uuid: unit.image_unit_uuid,
                    product_uuid: product.product_uuid,
                    batch_uuid: new_batch.batch_uuid,
                    source_url: unit.source_url.clone(),
                    output_url: None,
                    status: UnitState::Pending,
                    error_message: None,
                    attempts: 0,
                    created_at: now,
                    updated_at: now,
                },
            );
        }

        self.batches.insert(
            new_batch.batch_uuid,
            Arc::new(Mutex::new(BatchRecord {
                batch: batch.clone(),
                products,
                unit_ids,
                task_handles: Vec::new(),
                reports: HashMap::new(),
            })),
        );

        Ok(batch)
    }

    async fn find_batch(&self, batch_uuid: Uuid) -> PersistenceResult<Option<Batch>> {
        self.check("find_batch")?;
        Ok(self
            .batches
            .get(&batch_uuid)
            .map(|record| record.lock().batch.clone()))
    }

    async fn start_dispatch(
        &self,
        batch_uuid: Uuid,
        dispatched_at: DateTime<Utc>,
    ) -> PersistenceResult<bool> {
        self.check("start_dispatch")?;
        let record = self.record(batch_uuid)?;
        let mut record = record.lock();

        if record.batch.status != BatchState::Pending {
            return Ok(false);
        }
        record.batch.status = BatchState::Processing;
        record.batch.dispatched_at = Some(dispatched_at);
        record.batch.updated_at = Utc::now();
        Ok(true)
    }

    async fn register_dispatch(
        &self,
        registration: &DispatchRegistration,
    ) -> PersistenceResult<()> {
        self.check("register_dispatch")?;
        let record = self.record(registration.batch_uuid)?;
        let mut record = record.lock();

        record.task_handles = registration.handles.clone();
        record.batch.updated_at = Utc::now();
        Ok(())
    }

    async fn find_unit(&self, image_unit_uuid: Uuid) -> PersistenceResult<Option<ImageUnit>> {
        self.check("find_unit")?;
        Ok(self.units.get(&image_unit_uuid).map(|u| u.clone()))
    }

    async fn transition_unit(&self, transition: &UnitTransition) -> PersistenceResult<bool> {
        self.check("transition_unit")?;
        let Some(mut unit) = self.units.get_mut(&transition.image_unit_uuid) else {
            return Ok(false);
        };
        if unit.status != transition.from {
            return Ok(false);
        }

        unit.status = transition.to;
        if transition.to == UnitState::Processing {
            unit.attempts += 1;
        }
        if transition.output_url.is_some() {
            unit.output_url = transition.output_url.clone();
        }
        if transition.error_message.is_some() {
            unit.error_message = transition.error_message.clone();
        }
        unit.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_report(&self, report: &UnitReport) -> PersistenceResult<ReportOutcome> {
        self.check("record_report")?;
        let record = self.record(report.batch_uuid)?;
        let mut record = record.lock();

        if record.reports.contains_key(&report.image_unit_uuid) {
            return Ok(ReportOutcome::Duplicate);
        }
        if record.batch.remaining_units == 0 {
            return Err(PersistenceError::InvalidStoredValue {
                field: "remaining_units".to_string(),
                value: "0".to_string(),
            });
        }

        record
            .reports
            .insert(report.image_unit_uuid, report.clone());
        record.batch.remaining_units -= 1;
        record.batch.updated_at = Utc::now();

        Ok(match record.batch.remaining_units {
            0 => ReportOutcome::Released,
            remaining => ReportOutcome::Pending { remaining },
        })
    }

    async fn list_reports(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<UnitReport>> {
        self.check("list_reports")?;
        let Some(record) = self.batches.get(&batch_uuid).map(|r| Arc::clone(r.value())) else {
            return Ok(Vec::new());
        };
        let mut reports: Vec<UnitReport> = record.lock().reports.values().cloned().collect();
        reports.sort_by_key(|r| r.reported_at);
        Ok(reports)
    }

    async fn commit_finalization(
        &self,
        completion: &BatchCompletion,
    ) -> PersistenceResult<bool> {
        self.check("commit_finalization")?;
        let record = self.record(completion.batch_uuid)?;
        let mut record = record.lock();

        if record.batch.finalized_at.is_some() {
            return Ok(false);
        }
        let now = Utc::now();
        record.batch.status = completion.status;
        record.batch.output_artifact = completion.output_artifact.clone();
        record.batch.finalized_at = Some(now);
        record.batch.updated_at = now;
        Ok(true)
    }

    async fn record_delivery_error(
        &self,
        batch_uuid: Uuid,
        error: Option<&str>,
    ) -> PersistenceResult<()> {
        self.check("record_delivery_error")?;
        let record = self.record(batch_uuid)?;
        let mut record = record.lock();

        record.batch.delivery_error = error.map(str::to_string);
        record.batch.updated_at = Utc::now();
        Ok(())
    }

    async fn list_products(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<Product>> {
        self.check("list_products")?;
        let Some(record) = self.batches.get(&batch_uuid).map(|r| Arc::clone(r.value())) else {
            return Ok(Vec::new());
        };
        let mut products = record.lock().products.clone();
        products.sort_by_key(|p| p.position);
        Ok(products)
    }

    async fn list_units(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<ImageUnit>> {
        self.check("list_units")?;
        let Some(record) = self.batches.get(&batch_uuid).map(|r| Arc::clone(r.value())) else {
            return Ok(Vec::new());
        };
        let unit_ids = record.lock().unit_ids.clone();
        Ok(unit_ids
            .iter()
            .filter_map(|id| self.units.get(id).map(|u| u.clone()))
            .collect())
    }

    async fn count_units(&self, batch_uuid: Uuid) -> PersistenceResult<UnitCounts> {
        let units = self.list_units(batch_uuid).await?;
        let mut counts = UnitCounts::default();
        for unit in &units {
            counts.add(unit.status, 1);
        }
        Ok(counts)
    }

    async fn find_stale_units(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> PersistenceResult<Vec<ImageUnit>> {
        self.check("find_stale_units")?;
        let processing_batches: Vec<Uuid> = self
            .batches
            .iter()
            .filter(|entry| entry.value().lock().batch.status == BatchState::Processing)
            .map(|entry| *entry.key())
            .collect();

        let mut stale: Vec<ImageUnit> = self
            .units
            .iter()
            .filter(|unit| {
                !unit.status.is_terminal()
                    && unit.updated_at < older_than
                    && processing_batches.contains(&unit.batch_uuid)
            })
            .map(|unit| unit.clone())
            .collect();
        stale.sort_by_key(|u| u.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn find_stalled_batches(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> PersistenceResult<Vec<Batch>> {
        self.check("find_stalled_batches")?;
        let mut stalled: Vec<Batch> = self
            .batches
            .iter()
            .map(|entry| entry.value().lock().batch.clone())
            .filter(|batch| {
                batch.finalized_at.is_none()
                    && batch.updated_at < older_than
                    && (batch.status == BatchState::Pending
                        || (batch.status == BatchState::Processing && batch.is_drained()))
            })
            .collect();
        stalled.sort_by_key(|b| b.updated_at);
        stalled.truncate(limit.max(0) as usize);
        Ok(stalled)
    }

    async fn touch_unit(&self, image_unit_uuid: Uuid) -> PersistenceResult<()> {
        self.check("touch_unit")?;
        match self.units.get_mut(&image_unit_uuid) {
            Some(mut unit) => {
                unit.updated_at = Utc::now();
                Ok(())
            }
            None => Err(PersistenceError::MissingRecord {
                entity: "image unit",
                id: image_unit_uuid,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewImageUnit, NewProduct};

    fn new_batch(unit_count: usize) -> NewBatch {
        let mut batch = NewBatch::new(None);
        batch.products.push(NewProduct {
            product_uuid: Uuid::new_v4(),
            serial: 1,
            name: "Widget".to_string(),
            position: 0,
            units: (0..unit_count)
                .map(|i| NewImageUnit {
                    image_unit_uuid: Uuid::new_v4(),
                    source_url: format!("http://images.test/{i}.png"),
                })
                .collect(),
        });
        batch
    }

    #[tokio::test]
    async fn test_create_batch_sets_counter_to_expected_total() {
        let store = InMemoryBatchStore::new();
        let batch = store.create_batch(&new_batch(3)).await.unwrap();

        assert_eq!(batch.expected_total, 3);
        assert_eq!(batch.remaining_units, 3);
        assert_eq!(store.list_units(batch.batch_uuid).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryBatchStore::new();
        let batch = store.create_batch(&new_batch(1)).await.unwrap();
        let unit = store.list_units(batch.batch_uuid).await.unwrap().remove(0);

        let start = UnitTransition::new(
            unit.image_unit_uuid,
            UnitState::Pending,
            UnitState::Processing,
        );
        assert!(store.transition_unit(&start).await.unwrap());
        assert!(!store.transition_unit(&start).await.unwrap());

        let unit = store.find_unit(unit.image_unit_uuid).await.unwrap().unwrap();
        assert_eq!(unit.status, UnitState::Processing);
        assert_eq!(unit.attempts, 1);
    }

    #[tokio::test]
    async fn test_duplicate_report_does_not_decrement() {
        let store = InMemoryBatchStore::new();
        let batch = store.create_batch(&new_batch(2)).await.unwrap();
        let units = store.list_units(batch.batch_uuid).await.unwrap();

        let report = UnitReport::completed(batch.batch_uuid, units[0].image_unit_uuid);
        assert_eq!(
            store.record_report(&report).await.unwrap(),
            ReportOutcome::Pending { remaining: 1 }
        );
        assert_eq!(
            store.record_report(&report).await.unwrap(),
            ReportOutcome::Duplicate
        );

        let last = UnitReport::failed(batch.batch_uuid, units[1].image_unit_uuid, "boom");
        assert_eq!(
            store.record_report(&last).await.unwrap(),
            ReportOutcome::Released
        );
    }

    #[tokio::test]
    async fn test_commit_finalization_once() {
        let store = InMemoryBatchStore::new();
        let batch = store.create_batch(&new_batch(0)).await.unwrap();
        let completion = BatchCompletion {
            batch_uuid: batch.batch_uuid,
            status: BatchState::Completed,
            output_artifact: Some("file:///out.csv".to_string()),
        };

        assert!(store.commit_finalization(&completion).await.unwrap());
        let failed = BatchCompletion {
            status: BatchState::Failed,
            ..completion.clone()
        };
        assert!(!store.commit_finalization(&failed).await.unwrap());

        let stored = store.find_batch(batch.batch_uuid).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchState::Completed);
        assert!(stored.finalized_at.is_some());
    }

    #[tokio::test]
    async fn test_stalled_batches() {
        let store = InMemoryBatchStore::new();
        let undispatched = store.create_batch(&new_batch(1)).await.unwrap();
        let drained = store.create_batch(&new_batch(1)).await.unwrap();
        let running = store.create_batch(&new_batch(2)).await.unwrap();

        for batch in [&drained, &running] {
            store.start_dispatch(batch.batch_uuid, Utc::now()).await.unwrap();
        }
        let unit = store.list_units(drained.batch_uuid).await.unwrap().remove(0);
        store
            .record_report(&UnitReport::completed(drained.batch_uuid, unit.image_unit_uuid))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let mut stalled: Vec<Uuid> = store
            .find_stalled_batches(later, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.batch_uuid)
            .collect();
        stalled.sort();
        let mut expected = vec![undispatched.batch_uuid, drained.batch_uuid];
        expected.sort();
        assert_eq!(stalled, expected);

        let earlier = Utc::now() - chrono::Duration::hours(1);
        assert!(store.find_stalled_batches(earlier, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_hits_one_call() {
        let store = InMemoryBatchStore::new();
        let batch = store.create_batch(&new_batch(1)).await.unwrap();

        store.fail_next("list_reports");
        assert!(matches!(
            store.list_reports(batch.batch_uuid).await,
            Err(PersistenceError::Unavailable(_))
        ));
        assert!(store.list_reports(batch.batch_uuid).await.is_ok());
        assert!(store.find_batch(batch.batch_uuid).await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let store = InMemoryBatchStore::new();
        store.set_available(false);

        let result = store.find_batch(Uuid::new_v4()).await;
        assert!(matches!(result, Err(PersistenceError::Unavailable(_))));
    }
}
