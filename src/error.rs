//! Error types for the image batch system.
//!
//! Errors are split along the propagation policy: intake validation aborts before any
//! work exists, unit processing failures are isolated to their unit, persistence and
//! messaging failures always propagate so the queue can redeliver, and delivery
//! failures are recorded without touching the batch's terminal status.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::orchestration::IntakeReport;
use crate::state_machine::StateMachineError;

#[derive(Debug, Error)]
pub enum ImageBatchError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Batch not found: {0}")]
    NotFound(Uuid),
    #[error("Image unit not found: {0}")]
    UnitNotFound(Uuid),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    /// Intake committed the batch but dispatching it failed. The report carries the
    /// batch id so the caller can retry dispatch or leave it to the reconciler.
    #[error("batch {} was persisted but dispatch failed: {source}", .report.batch_uuid)]
    DispatchFailed {
        report: Box<IntakeReport>,
        source: Box<ImageBatchError>,
    },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImageBatchError {
    /// Whether the failed operation should be retried through queue redelivery.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(_) | Self::Messaging(_) => true,
            Self::DispatchFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for ImageBatchError {
    fn from(err: sqlx::Error) -> Self {
        ImageBatchError::Persistence(PersistenceError::Database(err))
    }
}

pub type Result<T> = std::result::Result<T, ImageBatchError>;

/// Wholesale intake failure. The batch is never created when one of these is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("batch contains no rows")]
    EmptyBatch,
    #[error("every row was rejected ({} errors)", .row_errors.len())]
    AllRowsRejected { row_errors: Vec<RowError> },
    #[error("missing required column '{column}'")]
    MissingColumn { column: String },
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl From<csv::Error> for ValidationError {
    fn from(err: csv::Error) -> Self {
        ValidationError::MalformedInput(err.to_string())
    }
}

/// A single rejected intake row. Collected into the intake report, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("row {row}: {reason}")]
pub struct RowError {
    /// 1-based row number within the submitted batch
    pub row: usize,
    pub serial: Option<String>,
    pub reason: RowErrorReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowErrorReason {
    #[error("malformed serial '{value}'")]
    MalformedSerial { value: String },
    #[error("duplicate serial '{value}'")]
    DuplicateSerial { value: String },
    #[error("product name is blank")]
    BlankName,
    #[error("malformed image location '{location}': {detail}")]
    MalformedLocation { location: String, detail: String },
}

/// Store failures. Always propagated; never converted into a unit failure.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid stored value for {field}: {value}")]
    InvalidStoredValue { field: String, value: String },
    #[error("{entity} {id} does not exist")]
    MissingRecord { entity: &'static str, id: Uuid },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Source fetch failure; terminal for the unit that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("{url} exceeds the {limit} byte limit")]
    TooLarge { url: String, limit: u64 },
}

/// Decode, resize or encode failure; terminal for the unit that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("could not encode image: {0}")]
    Encode(String),
    #[error("invalid transform parameters: {0}")]
    InvalidParameters(String),
}

impl From<image::ImageError> for TransformError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Encoding(e) => TransformError::Encode(e.to_string()),
            other => TransformError::Decode(other.to_string()),
        }
    }
}

/// Everything that can fail a single unit during steps 2–4 of processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("output storage failed: {0}")]
    Storage(String),
}

impl ProcessingError {
    /// Short machine-readable classification stored alongside the failure message.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch_error",
            Self::Transform(_) => "transform_error",
            Self::Storage(_) => "storage_error",
        }
    }
}

/// Outbound callback failure. Logged and recorded; the batch status stands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("callback request failed: {0}")]
    Request(String),
    #[error("callback returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Request(err.to_string())
    }
}
