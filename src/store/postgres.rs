//! # PostgreSQL Batch Store
//!
//! [`BatchStore`] over a `sqlx::PgPool`. All queries are runtime-checked so the crate
//! builds without a live database; the schema ships as embedded migrations under
//! `migrations/`.
//!
//! ## Barrier statement
//!
//! [`PostgresBatchStore::record_report`] runs, inside one transaction:
//!
//! ```sql
//! INSERT INTO imagebatch_unit_reports ... ON CONFLICT DO NOTHING;
//! UPDATE imagebatch_batches SET remaining_units = remaining_units - 1 ... RETURNING remaining_units;
//! ```
//!
//! The insert takes the report row's unique key, so a concurrent duplicate blocks on it
//! and then sees the conflict. The decrement takes the batch row lock, so two distinct
//! reports are serialised on the counter and exactly one of them observes zero.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BatchStore, PersistenceResult};
use crate::error::PersistenceError;
use crate::messaging::DispatchRegistration;
use crate::models::{
    Batch, BatchCompletion, ImageUnit, NewBatch, Product, ReportOutcome, UnitCounts,
    UnitReport, UnitTransition,
};
use crate::state_machine::{BatchState, UnitState};

const BATCH_COLUMNS: &str = "batch_uuid, status, expected_total, remaining_units, \
    input_artifact, output_artifact, delivery_error, dispatched_at, finalized_at, \
    created_at, updated_at";

const UNIT_COLUMNS: &str = "u.image_unit_uuid, u.product_uuid, u.batch_uuid, u.source_url, \
    u.output_url, u.status, u.error_message, u.attempts, u.created_at, u.updated_at";

#[derive(Debug, Clone)]
pub struct PostgresBatchStore {
    pool: PgPool,
}

impl PostgresBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> PersistenceResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("🗃️ Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    async fn create_batch(&self, batch: &NewBatch) -> PersistenceResult<Batch> {
        let mut tx = self.pool.begin().await?;
        let expected_total = batch.expected_total();

        let created = sqlx::query_as::<_, Batch>(&format!(
            r#"
            INSERT INTO imagebatch_batches
                (batch_uuid, status, expected_total, remaining_units, input_artifact)
            VALUES ($1, $2, $3, $3, $4)
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(batch.batch_uuid)
        .bind(BatchState::Pending.as_str())
        .bind(expected_total)
        .bind(&batch.input_artifact)
        .fetch_one(&mut *tx)
        .await?;

        for product in &batch.products {
            sqlx::query(
                r#"
                INSERT INTO imagebatch_products (product_uuid, batch_uuid, serial, name, position)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(product.product_uuid)
            .bind(batch.batch_uuid)
            .bind(product.serial)
            .bind(&product.name)
            .bind(product.position)
            .execute(&mut *tx)
            .await?;

            for (position, unit) in product.units.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO imagebatch_image_units
                        (image_unit_uuid, product_uuid, batch_uuid, source_url, status, position)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(unit.image_unit_uuid)
                .bind(product.product_uuid)
                .bind(batch.batch_uuid)
                .bind(&unit.source_url)
                .bind(UnitState::Pending.as_str())
                .bind(position as i32)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(
            batch_uuid = %batch.batch_uuid,
            expected_total = expected_total,
            "Batch graph persisted"
        );
        Ok(created)
    }

    async fn find_batch(&self, batch_uuid: Uuid) -> PersistenceResult<Option<Batch>> {
        let batch = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM imagebatch_batches WHERE batch_uuid = $1"
        ))
        .bind(batch_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(batch)
    }

    async fn start_dispatch(
        &self,
        batch_uuid: Uuid,
        dispatched_at: DateTime<Utc>,
    ) -> PersistenceResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE imagebatch_batches
            SET status = $2, dispatched_at = $3, updated_at = NOW()
            WHERE batch_uuid = $1 AND status = $4
            "#,
        )
        .bind(batch_uuid)
        .bind(BatchState::Processing.as_str())
        .bind(dispatched_at)
        .bind(BatchState::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn register_dispatch(
        &self,
        registration: &DispatchRegistration,
    ) -> PersistenceResult<()> {
        let handles = serde_json::to_value(&registration.handles)?;
        let result = sqlx::query(
            "UPDATE imagebatch_batches SET task_handles = $2, updated_at = NOW() WHERE batch_uuid = $1",
        )
        .bind(registration.batch_uuid)
        .bind(handles)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::MissingRecord {
                entity: "batch",
                id: registration.batch_uuid,
            });
        }
        Ok(())
    }

    async fn find_unit(&self, image_unit_uuid: Uuid) -> PersistenceResult<Option<ImageUnit>> {
        let unit = sqlx::query_as::<_, ImageUnit>(&format!(
            "SELECT {UNIT_COLUMNS} FROM imagebatch_image_units u WHERE u.image_unit_uuid = $1"
        ))
        .bind(image_unit_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(unit)
    }

    async fn transition_unit(&self, transition: &UnitTransition) -> PersistenceResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE imagebatch_image_units
            SET status = $3,
                output_url = COALESCE($4, output_url),
                error_message = COALESCE($5, error_message),
                attempts = CASE WHEN $3 = 'processing' THEN attempts + 1 ELSE attempts END,
                updated_at = NOW()
            WHERE image_unit_uuid = $1 AND status = $2
            "#,
        )
        .bind(transition.image_unit_uuid)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(&transition.output_url)
        .bind(&transition.error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_report(&self, report: &UnitReport) -> PersistenceResult<ReportOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO imagebatch_unit_reports
                (batch_uuid, image_unit_uuid, status, error_message, reported_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (batch_uuid, image_unit_uuid) DO NOTHING
            "#,
        )
        .bind(report.batch_uuid)
        .bind(report.image_unit_uuid)
        .bind(report.status.as_str())
        .bind(&report.error_message)
        .bind(report.reported_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ReportOutcome::Duplicate);
        }

        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE imagebatch_batches
            SET remaining_units = remaining_units - 1, updated_at = NOW()
            WHERE batch_uuid = $1 AND remaining_units > 0
            RETURNING remaining_units
            "#,
        )
        .bind(report.batch_uuid)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(remaining) = remaining else {
            tx.rollback().await?;
            return Err(PersistenceError::InvalidStoredValue {
                field: "remaining_units".to_string(),
                value: "0".to_string(),
            });
        };

        tx.commit().await?;
        Ok(match remaining {
            0 => ReportOutcome::Released,
            remaining => ReportOutcome::Pending { remaining },
        })
    }

    async fn list_reports(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<UnitReport>> {
        let reports = sqlx::query_as::<_, UnitReport>(
            r#"
            SELECT batch_uuid, image_unit_uuid, status, error_message, reported_at
            FROM imagebatch_unit_reports
            WHERE batch_uuid = $1
            ORDER BY reported_at
            "#,
        )
        .bind(batch_uuid)
        .fetch_all(&self.pool)
        .await?;
        Ok(reports)
    }

    async fn commit_finalization(
        &self,
        completion: &BatchCompletion,
    ) -> PersistenceResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE imagebatch_batches
            SET status = $2, output_artifact = $3, finalized_at = NOW(), updated_at = NOW()
            WHERE batch_uuid = $1 AND finalized_at IS NULL
            "#,
        )
        .bind(completion.batch_uuid)
        .bind(completion.status.as_str())
        .bind(&completion.output_artifact)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_delivery_error(
        &self,
        batch_uuid: Uuid,
        error: Option<&str>,
    ) -> PersistenceResult<()> {
        sqlx::query(
            "UPDATE imagebatch_batches SET delivery_error = $2, updated_at = NOW() WHERE batch_uuid = $1",
        )
        .bind(batch_uuid)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_products(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>(
            r#"
            SELECT product_uuid, batch_uuid, serial, name, position, created_at
            FROM imagebatch_products
            WHERE batch_uuid = $1
            ORDER BY position
            "#,
        )
        .bind(batch_uuid)
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }

    async fn list_units(&self, batch_uuid: Uuid) -> PersistenceResult<Vec<ImageUnit>> {
        let units = sqlx::query_as::<_, ImageUnit>(&format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM imagebatch_image_units u
            JOIN imagebatch_products p ON p.product_uuid = u.product_uuid
            WHERE u.batch_uuid = $1
            ORDER BY p.position, u.position
            "#
        ))
        .bind(batch_uuid)
        .fetch_all(&self.pool)
        .await?;
        Ok(units)
    }

    async fn count_units(&self, batch_uuid: Uuid) -> PersistenceResult<UnitCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM imagebatch_image_units
            WHERE batch_uuid = $1
            GROUP BY status
            "#,
        )
        .bind(batch_uuid)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = UnitCounts::default();
        for (status, count) in rows {
            let state: UnitState =
                status
                    .parse()
                    .map_err(|_| PersistenceError::InvalidStoredValue {
                        field: "image_units.status".to_string(),
                        value: status.clone(),
                    })?;
            counts.add(state, count);
        }
        Ok(counts)
    }

    async fn find_stale_units(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> PersistenceResult<Vec<ImageUnit>> {
        let units = sqlx::query_as::<_, ImageUnit>(&format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM imagebatch_image_units u
            JOIN imagebatch_batches b ON b.batch_uuid = u.batch_uuid
            WHERE b.status = 'processing'
              AND u.status IN ('pending', 'processing')
              AND u.updated_at < $1
            ORDER BY u.updated_at
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(units)
    }

    async fn find_stalled_batches(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> PersistenceResult<Vec<Batch>> {
        let batches = sqlx::query_as::<_, Batch>(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM imagebatch_batches
            WHERE finalized_at IS NULL
              AND updated_at < $1
              AND (status = 'pending' OR (status = 'processing' AND remaining_units = 0))
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(batches)
    }

    async fn touch_unit(&self, image_unit_uuid: Uuid) -> PersistenceResult<()> {
        let result = sqlx::query(
            "UPDATE imagebatch_image_units SET updated_at = NOW() WHERE image_unit_uuid = $1",
        )
        .bind(image_unit_uuid)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::MissingRecord {
                entity: "image unit",
                id: image_unit_uuid,
            });
        }
        Ok(())
    }
}
