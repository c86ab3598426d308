//! # Orchestration
//!
//! The batch lifecycle from submission to delivery:
//!
//! - **csv_ingress** / **batch_intake**: parse, validate and decompose a submission into
//!   products and image units, persisted atomically with the barrier counter
//! - **task_dispatcher**: one queued task per image unit, routed to a lane
//! - **completion_barrier**: fan-in; exactly one terminal report releases the batch
//! - **batch_finalizer**: exactly-once finalization, export assembly and delivery
//! - **status_query**: read-only progress
//! - **unit_reconciler**: re-submits units whose task was lost
//! - **bootstrap**: wires all of the above from configuration
//!
//! The per-unit work itself lives in [`crate::worker`].

pub mod batch_finalizer;
pub mod batch_intake;
pub mod bootstrap;
pub mod completion_barrier;
pub mod completion_policy;
pub mod csv_ingress;
pub mod export;
pub mod result_delivery;
pub mod status_query;
pub mod task_dispatcher;
pub mod unit_reconciler;

pub use batch_finalizer::{BatchFinalizer, FinalizationReport, FinalizationResult};
pub use batch_intake::{decompose, BatchIntake, IntakeReport};
pub use bootstrap::{OrchestrationSystem, OrchestrationSystemBuilder, ReconcilerHandle};
pub use completion_barrier::{BarrierOutcome, CompletionBarrier};
pub use completion_policy::{CompletionPolicy, OutcomeSummary};
pub use csv_ingress::{parse_batch_csv, split_locations, IntakeRow};
pub use export::{build_export_rows, render_csv, ExportRow};
pub use result_delivery::{DeliveryOutcome, DeliveryPayload, HttpCallbackDelivery, ResultDelivery};
pub use status_query::{progress_percentage, BatchProgress, StatusQuery};
pub use task_dispatcher::{DispatchOutcome, LaneSelector, TaskDispatcher};
pub use unit_reconciler::{ReconcileSummary, UnitReconciler};
