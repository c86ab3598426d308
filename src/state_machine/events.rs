use serde::{Deserialize, Serialize};

/// Events that can trigger image unit state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UnitEvent {
    /// A worker picked the unit up
    Start,
    /// Output was produced and persisted at the given location
    Complete(String),
    /// Fetch, transform or persistence of the output failed
    Fail(String),
}

impl UnitEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete(_) => "complete",
            Self::Fail(_) => "fail",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Extract the output location if this is a completion event
    pub fn output_url(&self) -> Option<&str> {
        match self {
            Self::Complete(url) => Some(url),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Fail(_))
    }
}

/// Events that can trigger batch state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BatchEvent {
    /// All unit tasks were handed to the queue
    Dispatch,
    /// Finalizer decided the batch outcome; `true` when the completion policy was met
    Finalize(bool),
}

impl BatchEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Finalize(_) => "finalize",
        }
    }
}
