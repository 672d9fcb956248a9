//! Retry budgets for planning rounds and implementation attempts.

use serde::{Deserialize, Serialize};

use crate::core::types::{RunResult, Step};

/// Numeric limits that bound every loop in a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_planning_rounds: u32,
    pub max_implementation_attempts: u32,
    pub max_consecutive_failures: u32,
    /// Whether a completion-judge rejection also counts as a consecutive failure.
    pub completion_rejection_counts_as_failure: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_planning_rounds: 5,
            max_implementation_attempts: 10,
            max_consecutive_failures: 3,
            completion_rejection_counts_as_failure: false,
        }
    }
}

impl Limits {
    /// Terminal result once a step has spent its budget, attempts checked first.
    pub fn step_exhausted(&self, step: &Step) -> Option<RunResult> {
        if step.attempts_started >= self.max_implementation_attempts {
            return Some(RunResult::AbandonedAfterMaxAttempts);
        }
        if step.consecutive_failures >= self.max_consecutive_failures {
            return Some(RunResult::AbandonedAfterConsecutiveFailures);
        }
        None
    }

    pub fn planning_rounds_exhausted(&self, rounds: u32) -> bool {
        rounds >= self.max_planning_rounds
    }

    pub fn planning_failures_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_consecutive_failures
    }
}
