//! # Image Unit Model
//!
//! The smallest independently processed piece of work: one source image.
//!
//! ## Single writer
//!
//! After intake, a unit row is only written by the worker holding its task. Every
//! write is a compare-and-set on the current status (see [`UnitTransition`]), so a
//! stale or duplicate worker can never move a unit backwards or overwrite a terminal
//! outcome.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE imagebatch_image_units (
//!   image_unit_uuid UUID PRIMARY KEY,
//!   product_uuid UUID NOT NULL REFERENCES imagebatch_products,
//!   batch_uuid UUID NOT NULL REFERENCES imagebatch_batches,
//!   source_url TEXT NOT NULL,
//!   output_url TEXT,
//!   status VARCHAR NOT NULL DEFAULT 'pending',
//!   error_message TEXT,
//!   attempts INTEGER NOT NULL DEFAULT 0,
//!   created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!   updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::state_machine::UnitState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ImageUnit {
    pub image_unit_uuid: Uuid,
    pub product_uuid: Uuid,
    pub batch_uuid: Uuid,
    pub source_url: String,
    pub output_url: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: UnitState,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageUnit {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Compare-and-set status change for one unit.
///
/// Applied only if the unit is currently in `from`. Entering `processing` increments
/// `attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTransition {
    pub image_unit_uuid: Uuid,
    pub from: UnitState,
    pub to: UnitState,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
}

impl UnitTransition {
    pub fn new(image_unit_uuid: Uuid, from: UnitState, to: UnitState) -> Self {
        Self {
            image_unit_uuid,
            from,
            to,
            output_url: None,
            error_message: None,
        }
    }

    pub fn with_output_url(mut self, output_url: impl Into<String>) -> Self {
        self.output_url = Some(output_url.into());
        self
    }

    pub fn with_error(mut self, error_message: impl Into<String>) -> Self {
        self.error_message = Some(error_message.into());
        self
    }
}

/// Per-status unit counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl UnitCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn terminal(&self) -> i64 {
        self.completed + self.failed
    }

    pub fn add(&mut self, state: UnitState, count: i64) {
        match state {
            UnitState::Pending => self.pending += count,
            UnitState::Processing => self.processing += count,
            UnitState::Completed => self.completed += count,
            UnitState::Failed => self.failed += count,
        }
    }
}
