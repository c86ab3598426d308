use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::StateMachineError;

/// Batch lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Created by intake, nothing dispatched yet
    #[default]
    Pending,
    /// Units have been dispatched
    Processing,
    /// Finalized and the completion policy was met
    Completed,
    /// Finalized and the completion policy was not met
    Failed,
}

impl BatchState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid batch state: {s}")),
        }
    }
}

impl TryFrom<String> for BatchState {
    type Error = StateMachineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map_err(|_| StateMachineError::UnknownState(value))
    }
}

/// Image unit lifecycle states
///
/// Transitions only move forward: `pending → processing → {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UnitState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if this is an active state (unit is being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UnitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid image unit state: {s}")),
        }
    }
}

impl TryFrom<String> for UnitState {
    type Error = StateMachineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map_err(|_| StateMachineError::UnknownState(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_state_terminal_check() {
        assert!(BatchState::Completed.is_terminal());
        assert!(BatchState::Failed.is_terminal());
        assert!(!BatchState::Pending.is_terminal());
        assert!(!BatchState::Processing.is_terminal());
    }

    #[test]
    fn test_unit_state_terminal_check() {
        assert!(UnitState::Completed.is_terminal());
        assert!(UnitState::Failed.is_terminal());
        assert!(!UnitState::Pending.is_terminal());
        assert!(!UnitState::Processing.is_terminal());
        assert!(UnitState::Processing.is_active());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(UnitState::Processing.to_string(), "processing");
        assert_eq!("failed".parse::<UnitState>().unwrap(), UnitState::Failed);
        assert!("error".parse::<UnitState>().is_err());

        assert_eq!(BatchState::Completed.to_string(), "completed");
        assert_eq!(
            "processing".parse::<BatchState>().unwrap(),
            BatchState::Processing
        );
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&UnitState::Completed).unwrap();
        assert_eq!(json, "\"completed\"");

        let parsed: BatchState = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(parsed, BatchState::Pending);
    }
}
