//! Terminal batch status decision.

use serde::{Deserialize, Serialize};

use crate::config::{CompletionPolicyKind, FinalizationConfig};
use crate::models::UnitReport;
use crate::state_machine::BatchState;

/// Tally of unit outcomes handed to the finalizer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub succeeded: i64,
    pub failed: i64,
}

impl OutcomeSummary {
    pub fn from_reports(reports: &[UnitReport]) -> Self {
        let succeeded = reports.iter().filter(|r| r.succeeded()).count() as i64;
        Self {
            succeeded,
            failed: reports.len() as i64 - succeeded,
        }
    }

    pub fn total(&self) -> i64 {
        self.succeeded + self.failed
    }

    /// Fraction of units that succeeded; an empty batch counts as fully successful
    pub fn success_ratio(&self) -> f64 {
        if self.total() == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.total() as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "ratio", rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Completed only when no unit failed
    #[default]
    AllSucceeded,
    /// Completed when at least one unit succeeded, or there were no units
    AnySucceeded,
    /// Completed when the success ratio reaches the threshold
    MinimumRatio(f64),
}

impl From<&FinalizationConfig> for CompletionPolicy {
    fn from(config: &FinalizationConfig) -> Self {
        match config.policy {
            CompletionPolicyKind::AllSucceeded => Self::AllSucceeded,
            CompletionPolicyKind::AnySucceeded => Self::AnySucceeded,
            CompletionPolicyKind::MinimumRatio => Self::MinimumRatio(config.minimum_ratio),
        }
    }
}

impl CompletionPolicy {
    pub fn decide(&self, summary: &OutcomeSummary) -> BatchState {
        let met = match self {
            Self::AllSucceeded => summary.failed == 0,
            Self::AnySucceeded => summary.total() == 0 || summary.succeeded > 0,
            Self::MinimumRatio(threshold) => summary.success_ratio() >= *threshold,
        };
        if met {
            BatchState::Completed
        } else {
            BatchState::Failed
        }
    }
}
