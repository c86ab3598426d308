//! State machines for image units and batches.
//!
//! Transitions are decided by pure tables ([`determine_unit_target`],
//! [`determine_batch_target`]) and persisted as compare-and-set writes, so a unit can
//! never move backwards even with several workers holding copies of its task.

pub mod errors;
pub mod events;
pub mod states;
pub mod unit_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::{BatchEvent, UnitEvent};
pub use states::{BatchState, UnitState};
pub use unit_state_machine::{determine_batch_target, determine_unit_target, UnitStateMachine};
