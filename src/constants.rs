//! # System Constants
//!
//! Shared names and literals used across intake, dispatch, processing and export.

/// Separator used both inside the intake location cell and in export location columns
pub const LOCATION_DELIMITER: char = ',';

/// Export artifact column headers, one row per product
pub const EXPORT_HEADERS: [&str; 4] = [
    "S. No.",
    "Product Name",
    "Input Image Urls",
    "Output Image Urls",
];

pub const EXPORT_CONTENT_TYPE: &str = "text/csv";

/// Default queue names per lane
pub mod lanes {
    pub const FAST_QUEUE: &str = "imagebatch_fast";
    pub const IMAGE_QUEUE: &str = "imagebatch_image";
}

/// Lifecycle event names published through the [`crate::events::EventPublisher`]
pub mod events {
    pub const BATCH_SUBMITTED: &str = "batch.submitted";
    pub const BATCH_DISPATCHED: &str = "batch.dispatched";
    pub const UNIT_STARTED: &str = "unit.started";
    pub const UNIT_COMPLETED: &str = "unit.completed";
    pub const UNIT_FAILED: &str = "unit.failed";
    pub const UNIT_REQUEUED: &str = "unit.requeued";
    pub const BARRIER_RELEASED: &str = "barrier.released";
    pub const BATCH_FINALIZED: &str = "batch.finalized";
    pub const DELIVERY_FAILED: &str = "delivery.failed";
}

/// Environment variables consulted outside the layered configuration
pub mod env {
    pub const ENVIRONMENT: &str = "IMAGEBATCH_ENV";
    pub const FALLBACK_ENVIRONMENT: &str = "APP_ENV";
    pub const CONFIG_PREFIX: &str = "IMAGEBATCH";
    pub const DATABASE_URL: &str = "DATABASE_URL";
}
