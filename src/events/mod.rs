//! Lifecycle event fan-out.
//!
//! Components publish milestones (batch submitted, unit completed, barrier released,
//! batch finalized ...) through a shared [`EventPublisher`]. Publishing never blocks
//! and never fails; subscribers that lag simply miss events.

pub mod publisher;

pub use publisher::{EventPublisher, LifecycleEvent};
