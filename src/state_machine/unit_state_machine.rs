use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::{
    errors::{invalid_transition, StateMachineError, StateMachineResult},
    events::{BatchEvent, UnitEvent},
    states::{BatchState, UnitState},
};
use crate::constants::events;
use crate::error::Result;
use crate::events::{EventPublisher, LifecycleEvent};
use crate::models::{ImageUnit, UnitTransition};
use crate::store::BatchStore;

/// Unit transition table. Monotonic: nothing re-enters `pending`, nothing leaves a
/// terminal state.
pub fn determine_unit_target(current: UnitState, event: &UnitEvent) -> StateMachineResult<UnitState> {
    let target = match (current, event) {
        (UnitState::Pending, UnitEvent::Start) => UnitState::Processing,
        (UnitState::Processing, UnitEvent::Complete(_)) => UnitState::Completed,
        (UnitState::Processing, UnitEvent::Fail(_)) => UnitState::Failed,
        (from, event) => return Err(invalid_transition(from, event.event_type())),
    };
    Ok(target)
}

/// Batch transition table
pub fn determine_batch_target(current: BatchState, event: BatchEvent) -> StateMachineResult<BatchState> {
    let target = match (current, event) {
        (BatchState::Pending, BatchEvent::Dispatch) => BatchState::Processing,
        // A zero-unit batch is finalized by the dispatcher before it is ever dispatched
        (BatchState::Pending | BatchState::Processing, BatchEvent::Finalize(true)) => {
            BatchState::Completed
        }
        (BatchState::Pending | BatchState::Processing, BatchEvent::Finalize(false)) => {
            BatchState::Failed
        }
        (from, event) => return Err(invalid_transition(from, event.event_type())),
    };
    Ok(target)
}

/// Persists unit transitions as compare-and-set writes and publishes the matching
/// lifecycle event. Holds no unit state of its own; the store is the source of truth.
#[derive(Debug, Clone)]
pub struct UnitStateMachine {
    store: Arc<dyn BatchStore>,
    publisher: EventPublisher,
}

impl UnitStateMachine {
    pub fn new(store: Arc<dyn BatchStore>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    /// Apply `event` to `unit`, which must reflect the unit's last known stored state.
    ///
    /// Fails with [`StateMachineError::InvalidTransition`] for an illegal event and with
    /// [`StateMachineError::ConcurrentModification`] when the stored status moved on
    /// since `unit` was read.
    pub async fn transition(&self, unit: &ImageUnit, event: UnitEvent) -> Result<UnitState> {
        let target = determine_unit_target(unit.status, &event)?;

        let mut transition = UnitTransition::new(unit.image_unit_uuid, unit.status, target);
        if let Some(url) = event.output_url() {
            transition = transition.with_output_url(url);
        }
        if let Some(error) = event.error_message() {
            transition = transition.with_error(error);
        }

        if !self.store.transition_unit(&transition).await? {
            return Err(StateMachineError::ConcurrentModification {
                entity: "image_unit".to_string(),
                entity_id: unit.image_unit_uuid.to_string(),
            }
            .into());
        }

        debug!(
            image_unit_uuid = %unit.image_unit_uuid,
            from = %unit.status,
            to = %target,
            event = event.event_type(),
            "Unit transitioned"
        );

        let name = match target {
            UnitState::Processing => events::UNIT_STARTED,
            UnitState::Completed => events::UNIT_COMPLETED,
            UnitState::Failed => events::UNIT_FAILED,
            UnitState::Pending => return Ok(target),
        };
        self.publisher.publish(LifecycleEvent::unit(
            name,
            unit.batch_uuid,
            unit.image_unit_uuid,
            json!({
                "from": unit.status,
                "to": target,
                "output_url": event.output_url(),
                "error": event.error_message(),
            }),
        ));

        Ok(target)
    }
}
