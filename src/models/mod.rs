//! # Unit-of-Work Model
//!
//! Plain data definitions for batches, products, image units and the barrier's unit
//! reports. Behaviour lives in the store, the state machine and the orchestration
//! components.

pub mod batch;
pub mod image_unit;
pub mod product;
pub mod unit_report;

pub use batch::{Batch, BatchCompletion, NewBatch, NewImageUnit, NewProduct};
pub use image_unit::{ImageUnit, UnitCounts, UnitTransition};
pub use product::Product;
pub use unit_report::{ReportOutcome, UnitReport};
