//! # Unit Report Model
//!
//! A terminal outcome reported to the completion barrier. The `(batch_uuid,
//! image_unit_uuid)` pair is unique: the first report for a unit decrements the
//! batch counter, every later one is recognised as a duplicate and ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::ImageUnit;
use crate::state_machine::UnitState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UnitReport {
    pub batch_uuid: Uuid,
    pub image_unit_uuid: Uuid,
    #[sqlx(try_from = "String")]
    pub status: UnitState,
    pub error_message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

impl UnitReport {
    pub fn completed(batch_uuid: Uuid, image_unit_uuid: Uuid) -> Self {
        Self {
            batch_uuid,
            image_unit_uuid,
            status: UnitState::Completed,
            error_message: None,
            reported_at: Utc::now(),
        }
    }

    pub fn failed(batch_uuid: Uuid, image_unit_uuid: Uuid, error: impl Into<String>) -> Self {
        Self {
            batch_uuid,
            image_unit_uuid,
            status: UnitState::Failed,
            error_message: Some(error.into()),
            reported_at: Utc::now(),
        }
    }

    /// Build a report from a unit that already sits in a terminal state
    pub fn from_terminal_unit(unit: &ImageUnit) -> Option<Self> {
        match unit.status {
            UnitState::Completed => Some(Self::completed(unit.batch_uuid, unit.image_unit_uuid)),
            UnitState::Failed => Some(Self::failed(
                unit.batch_uuid,
                unit.image_unit_uuid,
                unit.error_message.clone().unwrap_or_default(),
            )),
            UnitState::Pending | UnitState::Processing => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == UnitState::Completed
    }
}

/// Result of the barrier's atomic report-and-decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    /// The unit had already been counted; nothing changed
    Duplicate,
    /// Counted; this many units are still outstanding
    Pending { remaining: i64 },
    /// Counted, and this report drained the counter to zero
    Released,
}
