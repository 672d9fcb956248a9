//! Shared deterministic types for the task state machine.
//!
//! These types define stable contracts between the pure core and the
//! orchestration layer. They carry no I/O handles and serialize into the
//! session history unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Purpose of a model invocation. Used for prompts, logging and history only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Planner,
    PlanJudge,
    Implementer,
    ImplementationJudge,
    CompletionJudge,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::PlanJudge => "plan-judge",
            Role::Implementer => "implementer",
            Role::ImplementationJudge => "implementation-judge",
            Role::CompletionJudge => "completion-judge",
        }
    }

    pub fn is_judge(self) -> bool {
        matches!(
            self,
            Role::PlanJudge | Role::ImplementationJudge | Role::CompletionJudge
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
}

/// Parsed judge decision. A rejection always carries a non-empty rationale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub rationale: String,
}

pub const MISSING_RATIONALE: &str = "judge rejected without rationale";

impl Verdict {
    pub fn accept(rationale: impl Into<String>) -> Self {
        Self {
            decision: Decision::Accept,
            rationale: rationale.into(),
        }
    }

    pub fn reject(rationale: impl Into<String>) -> Self {
        let rationale = rationale.into();
        let rationale = if rationale.trim().is_empty() {
            MISSING_RATIONALE.to_string()
        } else {
            rationale
        };
        Self {
            decision: Decision::Reject,
            rationale,
        }
    }

    pub fn is_accept(&self) -> bool {
        self.decision == Decision::Accept
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "feedback", rename_all = "snake_case")]
pub enum PlanStatus {
    Proposed,
    Approved,
    Rejected(String),
}

/// Ordered steps produced by the planner.
///
/// Once `Approved` the step list is fixed; only attempt history grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub text: String,
    pub status: PlanStatus,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn is_approved(&self) -> bool {
        self.status == PlanStatus::Approved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Accepted,
    Abandoned,
}

/// One planned unit of work with its bounded attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Zero-based position in the plan.
    pub index: usize,
    pub description: String,
    pub status: StepStatus,
    /// Attempts started for this step, including one still in flight.
    pub attempts_started: u32,
    pub consecutive_failures: u32,
    pub attempts: Vec<Attempt>,
}

impl Step {
    pub fn new(index: usize, description: impl Into<String>) -> Self {
        Self {
            index,
            description: description.into(),
            status: StepStatus::Pending,
            attempts_started: 0,
            consecutive_failures: 0,
            attempts: Vec::new(),
        }
    }
}

/// Where an attempt's final verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// A model call failed; the verdict is a synthetic rejection.
    ModelFailure,
    /// The post-implementation check command failed; no judge was asked.
    CheckCommand,
    ImplementationJudge,
    CompletionJudge,
}

/// One implementer invocation and its evaluation. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// One-based attempt number within the step.
    pub number: u32,
    /// Rationale fed into this attempt from the previous rejection.
    pub feedback: Option<String>,
    pub response: Option<String>,
    pub has_diff: bool,
    pub source: VerdictSource,
    pub verdict: Verdict,
    /// Completion-judge verdict, when the implementation judge accepted.
    pub completion: Option<Verdict>,
}

impl Attempt {
    /// The verdict that decided this attempt.
    pub fn final_verdict(&self) -> &Verdict {
        self.completion.as_ref().unwrap_or(&self.verdict)
    }
}

/// One judged planner draft. `plan.status` is `Approved` or `Rejected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRound {
    pub round: u32,
    pub plan: Plan,
    pub verdict: Verdict,
}

/// Terminal outcome of a task. Exactly one per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Completed,
    AbandonedAfterMaxAttempts,
    AbandonedAfterConsecutiveFailures,
    Cancelled,
    ConfigurationError,
}

impl RunResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RunResult::Completed => "completed",
            RunResult::AbandonedAfterMaxAttempts => "abandoned after max attempts",
            RunResult::AbandonedAfterConsecutiveFailures => {
                "abandoned after consecutive failures"
            }
            RunResult::Cancelled => "cancelled",
            RunResult::ConfigurationError => "configuration error",
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a finished task leaves behind for reporting and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: String,
    pub result: RunResult,
    /// Rationale of the last rejection, or the setup error.
    pub detail: Option<String>,
    pub base_commit: Option<String>,
    pub branch: Option<String>,
    pub last_commit: Option<String>,
    pub planning: Vec<PlanRound>,
    pub plan: Option<Plan>,
}

impl TaskReport {
    pub fn attempt_count(&self) -> usize {
        self.plan
            .as_ref()
            .map(|plan| plan.steps.iter().map(|step| step.attempts.len()).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_never_has_empty_rationale() {
        let verdict = Verdict::reject("   ");
        assert_eq!(verdict.decision, Decision::Reject);
        assert_eq!(verdict.rationale, MISSING_RATIONALE);

        let verdict = Verdict::reject("missing step X");
        assert_eq!(verdict.rationale, "missing step X");
    }

    #[test]
    fn accept_may_be_terse() {
        let verdict = Verdict::accept("");
        assert!(verdict.is_accept());
        assert!(verdict.rationale.is_empty());
    }

    #[test]
    fn role_serializes_kebab_case() {
        let json = serde_json::to_string(&Role::ImplementationJudge).expect("serialize");
        assert_eq!(json, "\"implementation-judge\"");
        assert_eq!(Role::CompletionJudge.to_string(), "completion-judge");
        assert!(Role::PlanJudge.is_judge());
        assert!(!Role::Implementer.is_judge());
    }

    #[test]
    fn plan_status_round_trips_feedback() {
        let status = PlanStatus::Rejected("too vague".to_string());
        let json = serde_json::to_string(&status).expect("serialize");
        assert!(json.contains("too vague"));
        let back: PlanStatus = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, status);
    }
}
