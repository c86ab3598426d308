//! Queue message types for image unit tasks.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use crate::models::ImageUnit;

/// Named scheduling lane. Lane choice only affects fairness, never correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Trivial work (pass-through transforms)
    Fast,
    /// Decode/resize/encode work
    Image,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Fast, Lane::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "image" => Ok(Self::Image),
            other => Err(format!("Invalid lane: {other}")),
        }
    }
}

/// Why a unit task was put on the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueReason {
    Dispatch,
    Reconcile,
}

/// Everything a worker needs to process one unit without going back to intake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUnitMessage {
    pub batch_uuid: Uuid,
    pub product_uuid: Uuid,
    pub image_unit_uuid: Uuid,
    pub source_url: String,
    pub metadata: ImageUnitMessageMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUnitMessageMetadata {
    pub lane: Lane,
    pub reason: EnqueueReason,
    pub enqueued_at: DateTime<Utc>,
}

impl ImageUnitMessage {
    pub fn for_unit(unit: &ImageUnit, lane: Lane, reason: EnqueueReason) -> Self {
        Self {
            batch_uuid: unit.batch_uuid,
            product_uuid: unit.product_uuid,
            image_unit_uuid: unit.image_unit_uuid,
            source_url: unit.source_url.clone(),
            metadata: ImageUnitMessageMetadata {
                lane,
                reason,
                enqueued_at: Utc::now(),
            },
        }
    }
}

/// Identifies one submitted task on one lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub lane: Lane,
    pub message_id: i64,
}

/// The set of tasks submitted for a batch, registered so the barrier can be
/// reasoned about as "when all of these report, finalize once".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRegistration {
    pub batch_uuid: Uuid,
    pub handles: Vec<TaskHandle>,
    pub dispatched_at: DateTime<Utc>,
}

/// A message read from a lane, invisible to other readers until its visibility
/// timeout expires or it is acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub handle: TaskHandle,
    pub payload: serde_json::Value,
    /// Number of times this message has been read, including this read
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn parse<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| MessagingError::InvalidPayload(e.to_string()))
    }

    pub fn is_redelivery(&self) -> bool {
        self.read_count > 1
    }
}
