//! Task transition function.
//!
//! A task is a closed set of phases. Each phase names at most one external
//! call through [`TaskState::effect`]; the driver performs it and feeds the
//! outcome back as an [`Event`]. [`transition`] itself never touches the
//! outside world, so every rule here is tested without processes or git.

use crate::core::budget::Limits;
use crate::core::error::{ModelError, TransitionError};
use crate::core::implementation;
use crate::core::planning;
use crate::core::types::{Plan, PlanRound, Role, RunResult, Step, Verdict};

/// Previous draft and the judge's objection, handed to the next planner call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFeedback {
    pub previous_plan: String,
    pub rationale: String,
}

/// An implementer answer that has not been judged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptDraft {
    pub number: u32,
    pub feedback: Option<String>,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    StartingTask,
    Drafting {
        feedback: Option<PlanFeedback>,
    },
    AwaitingJudgment {
        draft: Plan,
        feedback: Option<PlanFeedback>,
    },
    StartingStep {
        step: usize,
    },
    RunningAttempt {
        step: usize,
        feedback: Option<String>,
    },
    RunningHook {
        step: usize,
        attempt: AttemptDraft,
    },
    RunningCheck {
        step: usize,
        attempt: AttemptDraft,
    },
    JudgingAttempt {
        step: usize,
        attempt: AttemptDraft,
        has_diff: bool,
    },
    JudgingStep {
        step: usize,
        attempt: AttemptDraft,
        has_diff: bool,
        verdict: Verdict,
    },
    CommittingStep {
        step: usize,
    },
    FinalizingTask,
    Finished(RunResult),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::StartingTask => "StartingTask",
            Phase::Drafting { .. } => "Drafting",
            Phase::AwaitingJudgment { .. } => "AwaitingJudgment",
            Phase::StartingStep { .. } => "StartingStep",
            Phase::RunningAttempt { .. } => "RunningAttempt",
            Phase::RunningHook { .. } => "RunningHook",
            Phase::RunningCheck { .. } => "RunningCheck",
            Phase::JudgingAttempt { .. } => "JudgingAttempt",
            Phase::JudgingStep { .. } => "JudgingStep",
            Phase::CommittingStep { .. } => "CommittingStep",
            Phase::FinalizingTask => "FinalizingTask",
            Phase::Finished(_) => "Finished",
        }
    }
}

/// Append-only history of a task. Only the transition function writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRecord {
    pub base_commit: Option<String>,
    /// Judged planning rounds.
    pub planning_rounds: u32,
    /// Consecutive planner or plan-judge failures since the last verdict.
    pub planning_failures: u32,
    pub planning: Vec<PlanRound>,
    /// The approved plan. Set exactly once.
    pub plan: Option<Plan>,
    pub last_rationale: Option<String>,
}

impl TaskRecord {
    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn step(&self, index: usize) -> Result<&Step, TransitionError> {
        self.plan
            .as_ref()
            .and_then(|plan| plan.steps.get(index))
            .ok_or(TransitionError::UnknownStep(index))
    }

    pub fn step_mut(&mut self, index: usize) -> Result<&mut Step, TransitionError> {
        self.plan
            .as_mut()
            .and_then(|plan| plan.steps.get_mut(index))
            .ok_or(TransitionError::UnknownStep(index))
    }

    pub fn step_count(&self) -> usize {
        self.plan.as_ref().map_or(0, |plan| plan.steps.len())
    }
}

/// The single external call a phase needs before it can move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    PrepareWorkspace,
    /// Pure bookkeeping; answered with [`Event::StepStarted`].
    BeginStep(usize),
    Invoke(Role),
    RunHook,
    RunCheck,
    CommitStep(usize),
    FinalizeTask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WorkspaceReady { base_commit: String },
    SetupFailed(String),
    StepStarted,
    ModelReplied(String),
    ModelFailed(ModelError),
    HookFinished { success: bool },
    CheckFinished {
        passed: bool,
        output: String,
        has_diff: bool,
    },
    StepCommitted,
    Finalized { has_changes: bool },
    EffectFailed(String),
    Cancelled,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::WorkspaceReady { .. } => "WorkspaceReady",
            Event::SetupFailed(_) => "SetupFailed",
            Event::StepStarted => "StepStarted",
            Event::ModelReplied(_) => "ModelReplied",
            Event::ModelFailed(_) => "ModelFailed",
            Event::HookFinished { .. } => "HookFinished",
            Event::CheckFinished { .. } => "CheckFinished",
            Event::StepCommitted => "StepCommitted",
            Event::Finalized { .. } => "Finalized",
            Event::EffectFailed(_) => "EffectFailed",
            Event::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub phase: Phase,
    pub record: TaskRecord,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            phase: Phase::StartingTask,
            record: TaskRecord::default(),
        }
    }

    pub fn effect(&self) -> Option<Effect> {
        let effect = match &self.phase {
            Phase::StartingTask => Effect::PrepareWorkspace,
            Phase::Drafting { .. } => Effect::Invoke(Role::Planner),
            Phase::AwaitingJudgment { .. } => Effect::Invoke(Role::PlanJudge),
            Phase::StartingStep { step } => Effect::BeginStep(*step),
            Phase::RunningAttempt { .. } => Effect::Invoke(Role::Implementer),
            Phase::RunningHook { .. } => Effect::RunHook,
            Phase::RunningCheck { .. } => Effect::RunCheck,
            Phase::JudgingAttempt { .. } => Effect::Invoke(Role::ImplementationJudge),
            Phase::JudgingStep { .. } => Effect::Invoke(Role::CompletionJudge),
            Phase::CommittingStep { step } => Effect::CommitStep(*step),
            Phase::FinalizingTask => Effect::FinalizeTask,
            Phase::Finished(_) => return None,
        };
        Some(effect)
    }

    pub fn result(&self) -> Option<RunResult> {
        match self.phase {
            Phase::Finished(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.result().is_some()
    }

    /// Step the current phase works on, if any.
    pub fn current_step(&self) -> Option<usize> {
        match &self.phase {
            Phase::StartingStep { step }
            | Phase::RunningAttempt { step, .. }
            | Phase::RunningHook { step, .. }
            | Phase::RunningCheck { step, .. }
            | Phase::JudgingAttempt { step, .. }
            | Phase::JudgingStep { step, .. }
            | Phase::CommittingStep { step } => Some(*step),
            _ => None,
        }
    }
}

pub(crate) fn unexpected(phase: &'static str, event: &Event) -> TransitionError {
    TransitionError::UnexpectedEvent {
        phase,
        event: event.name(),
    }
}

/// Apply one event to a task.
///
/// Cancellation is accepted in every live phase and always wins, including a
/// model call that reports it was cancelled. Anything delivered after the
/// task finished is an error.
pub fn transition(
    limits: &Limits,
    state: TaskState,
    event: Event,
) -> Result<TaskState, TransitionError> {
    let TaskState { phase, mut record } = state;
    if let Phase::Finished(result) = phase {
        return Err(TransitionError::AlreadyFinished(result.to_string()));
    }

    match event {
        Event::Cancelled | Event::ModelFailed(ModelError::Cancelled) => {
            return Ok(TaskState {
                phase: Phase::Finished(RunResult::Cancelled),
                record,
            });
        }
        Event::EffectFailed(reason) => {
            record.last_rationale = Some(reason);
            return Ok(TaskState {
                phase: Phase::Finished(RunResult::ConfigurationError),
                record,
            });
        }
        _ => {}
    }

    let phase_name = phase.name();
    let next = match phase {
        Phase::StartingTask => match event {
            Event::WorkspaceReady { base_commit } => {
                record.base_commit = Some(base_commit);
                Phase::Drafting { feedback: None }
            }
            Event::SetupFailed(reason) => {
                record.last_rationale = Some(reason);
                Phase::Finished(RunResult::ConfigurationError)
            }
            other => return Err(unexpected(phase_name, &other)),
        },
        Phase::Drafting { feedback } => planning::on_draft(limits, &mut record, feedback, event)?,
        Phase::AwaitingJudgment { draft, feedback } => {
            planning::on_judgment(limits, &mut record, draft, feedback, event)?
        }
        Phase::StartingStep { step } => match event {
            Event::StepStarted => implementation::start_step(&mut record, step)?,
            other => return Err(unexpected(phase_name, &other)),
        },
        Phase::RunningAttempt { step, feedback } => {
            implementation::on_attempt(limits, &mut record, step, feedback, event)?
        }
        Phase::RunningHook { step, attempt } => match event {
            Event::HookFinished { .. } => Phase::RunningCheck { step, attempt },
            other => return Err(unexpected(phase_name, &other)),
        },
        Phase::RunningCheck { step, attempt } => {
            implementation::on_check(limits, &mut record, step, attempt, event)?
        }
        Phase::JudgingAttempt {
            step,
            attempt,
            has_diff,
        } => implementation::on_attempt_judgment(
            limits,
            &mut record,
            step,
            attempt,
            has_diff,
            event,
        )?,
        Phase::JudgingStep {
            step,
            attempt,
            has_diff,
            verdict,
        } => implementation::on_step_judgment(
            limits,
            &mut record,
            step,
            attempt,
            has_diff,
            verdict,
            event,
        )?,
        Phase::CommittingStep { step } => match event {
            Event::StepCommitted => {
                let next = step + 1;
                if next < record.step_count() {
                    Phase::StartingStep { step: next }
                } else {
                    Phase::FinalizingTask
                }
            }
            other => return Err(unexpected(phase_name, &other)),
        },
        Phase::FinalizingTask => match event {
            Event::Finalized { .. } => Phase::Finished(RunResult::Completed),
            other => return Err(unexpected(phase_name, &other)),
        },
        Phase::Finished(result) => {
            return Err(TransitionError::AlreadyFinished(result.to_string()));
        }
    };

    Ok(TaskState {
        phase: next,
        record,
    })
}
