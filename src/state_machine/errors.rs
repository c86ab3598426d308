use thiserror::Error;

/// Error types for state machine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Concurrent modification detected for {entity} {entity_id}")]
    ConcurrentModification { entity: String, entity_id: String },

    #[error("Unknown state: {0}")]
    UnknownState(String),
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;

pub fn invalid_transition(from: impl ToString, event: impl Into<String>) -> StateMachineError {
    StateMachineError::InvalidTransition {
        from: from.to_string(),
        event: event.into(),
    }
}
