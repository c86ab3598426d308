#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # ImageBatch Core
//!
//! Batch orchestration for product image processing.
//!
//! ## Overview
//!
//! A caller submits a batch of product rows, each naming zero or more source images. The
//! batch is decomposed into one independently processed unit per image, the units are
//! fanned out over a distributed queue, and when the last unit reaches a terminal state
//! the batch is finalized exactly once: an export is assembled and delivered downstream.
//!
//! ## Module Organization
//!
//! - [`models`] - Batch, product, image unit and unit report records
//! - [`store`] - The durable store seam, with PostgreSQL and in-memory implementations
//! - [`messaging`] - Lane-named task queues with visibility timeouts
//! - [`state_machine`] - Batch and unit transition tables and the unit state machine
//! - [`orchestration`] - Intake, dispatch, completion barrier, finalization, status
//! - [`worker`] - Per-unit processing and the lane-polling worker pool
//! - [`events`] - In-process lifecycle event broadcasting
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use imagebatch_core::config::{Backend, ImageBatchConfig};
//! use imagebatch_core::orchestration::{IntakeRow, OrchestrationSystem};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ImageBatchConfig::default();
//! config.database.backend = Backend::Memory;
//!
//! let system = OrchestrationSystem::bootstrap(config).await?;
//! let workers = system.start_workers(&[]);
//!
//! let report = system
//!     .submit_batch(
//!         &[IntakeRow::new("1", "SKU1", ["https://example.com/a.png"])],
//!         None,
//!     )
//!     .await?;
//! let progress = system.get_status(report.batch_uuid).await?;
//! println!("{}: {:.0}%", progress.status, progress.percentage);
//!
//! workers.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit tests live next to the code. Integration tests under `tests/` run the whole
//! pipeline on the in-memory backend; the PostgreSQL suites are `#[ignore]`d and need
//! `DATABASE_URL`.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod store;
pub mod worker;

pub use config::ImageBatchConfig;
pub use error::{ImageBatchError, Result};
pub use orchestration::{BatchProgress, IntakeReport, IntakeRow, OrchestrationSystem};
