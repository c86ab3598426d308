//! # Batch Model
//!
//! One ingestion request and the aggregate that the completion barrier counts down.
//!
//! ## Database Schema
//!
//! Maps to the `imagebatch_batches` table:
//! ```sql
//! CREATE TABLE imagebatch_batches (
//!   batch_uuid UUID PRIMARY KEY,
//!   status VARCHAR NOT NULL DEFAULT 'pending',
//!   expected_total BIGINT NOT NULL,
//!   remaining_units BIGINT NOT NULL,
//!   input_artifact TEXT,
//!   output_artifact TEXT,
//!   delivery_error TEXT,
//!   task_handles JSONB,
//!   dispatched_at TIMESTAMPTZ,
//!   finalized_at TIMESTAMPTZ,
//!   created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!   updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! `expected_total` is written once in the transaction that creates the batch and is
//! never updated afterwards. `remaining_units` starts equal to it and only ever moves
//! down, one step per first terminal report of a unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::state_machine::BatchState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Batch {
    pub batch_uuid: Uuid,
    #[sqlx(try_from = "String")]
    pub status: BatchState,
    pub expected_total: i64,
    pub remaining_units: i64,
    pub input_artifact: Option<String>,
    pub output_artifact: Option<String>,
    pub delivery_error: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// Number of units that have reported a terminal outcome to the barrier
    pub fn reported_units(&self) -> i64 {
        self.expected_total - self.remaining_units
    }

    /// All expected units have reported
    pub fn is_drained(&self) -> bool {
        self.remaining_units == 0
    }
}

/// A fully decomposed batch ready to be written in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatch {
    pub batch_uuid: Uuid,
    pub input_artifact: Option<String>,
    pub products: Vec<NewProduct>,
}

impl NewBatch {
    pub fn new(input_artifact: Option<String>) -> Self {
        Self {
            batch_uuid: Uuid::new_v4(),
            input_artifact,
            products: Vec::new(),
        }
    }

    /// Sum of image locations over all products; the barrier's starting count
    pub fn expected_total(&self) -> i64 {
        self.products.iter().map(|p| p.units.len() as i64).sum()
    }

    pub fn units(&self) -> impl Iterator<Item = (&NewProduct, &NewImageUnit)> {
        self.products
            .iter()
            .flat_map(|product| product.units.iter().map(move |unit| (product, unit)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
    pub product_uuid: Uuid,
    pub serial: i64,
    pub name: String,
    pub position: i32,
    pub units: Vec<NewImageUnit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewImageUnit {
    pub image_unit_uuid: Uuid,
    pub source_url: String,
}

/// Final status and artifact written by the finalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCompletion {
    pub batch_uuid: Uuid,
    pub status: BatchState,
    pub output_artifact: Option<String>,
}
