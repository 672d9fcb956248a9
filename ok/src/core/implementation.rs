//! Implementation cycle: attempt, check, judge, and complete each step.
//!
//! An Attempt is one implementer invocation. Every rejection is recorded on
//! the step and fed into the next attempt as feedback, until the step is
//! accepted or its budget runs out.

use crate::core::budget::Limits;
use crate::core::error::TransitionError;
use crate::core::machine::{AttemptDraft, Event, Phase, TaskRecord, unexpected};
use crate::core::types::{Attempt, Role, StepStatus, Verdict, VerdictSource};
use crate::core::verdict::parse_for_role;

pub const CHECK_FAILED: &str = "post-implementation check failed";

pub(crate) fn start_step(record: &mut TaskRecord, step: usize) -> Result<Phase, TransitionError> {
    let current = record.step_mut(step)?;
    current.attempts_started = 0;
    current.consecutive_failures = 0;
    current.status = StepStatus::InProgress;
    Ok(Phase::RunningAttempt {
        step,
        feedback: None,
    })
}

/// Implementer answered (or failed). Either way the attempt has been spent.
pub(crate) fn on_attempt(
    limits: &Limits,
    record: &mut TaskRecord,
    step: usize,
    feedback: Option<String>,
    event: Event,
) -> Result<Phase, TransitionError> {
    match event {
        Event::ModelReplied(response) => {
            let current = record.step_mut(step)?;
            current.attempts_started += 1;
            Ok(Phase::RunningHook {
                step,
                attempt: AttemptDraft {
                    number: current.attempts_started,
                    feedback,
                    response,
                },
            })
        }
        Event::ModelFailed(err) => {
            let current = record.step_mut(step)?;
            current.attempts_started += 1;
            let attempt = Attempt {
                number: current.attempts_started,
                feedback,
                response: None,
                has_diff: false,
                source: VerdictSource::ModelFailure,
                verdict: Verdict::reject(format!("implementer failed: {err}")),
                completion: None,
            };
            reject(limits, record, step, attempt, true)
        }
        other => Err(unexpected("RunningAttempt", &other)),
    }
}

/// A failing check is a rejection; the judge is not asked.
pub(crate) fn on_check(
    limits: &Limits,
    record: &mut TaskRecord,
    step: usize,
    attempt: AttemptDraft,
    event: Event,
) -> Result<Phase, TransitionError> {
    let (passed, output, has_diff) = match event {
        Event::CheckFinished {
            passed,
            output,
            has_diff,
        } => (passed, output, has_diff),
        other => return Err(unexpected("RunningCheck", &other)),
    };

    if passed {
        return Ok(Phase::JudgingAttempt {
            step,
            attempt,
            has_diff,
        });
    }

    let rationale = if output.trim().is_empty() {
        CHECK_FAILED.to_string()
    } else {
        format!("{CHECK_FAILED}:\n{}", output.trim_end())
    };
    let attempt = Attempt {
        number: attempt.number,
        feedback: attempt.feedback,
        response: Some(attempt.response),
        has_diff,
        source: VerdictSource::CheckCommand,
        verdict: Verdict::reject(rationale),
        completion: None,
    };
    reject(limits, record, step, attempt, true)
}

pub(crate) fn on_attempt_judgment(
    limits: &Limits,
    record: &mut TaskRecord,
    step: usize,
    attempt: AttemptDraft,
    has_diff: bool,
    event: Event,
) -> Result<Phase, TransitionError> {
    let (verdict, source) = match event {
        Event::ModelReplied(text) => (
            parse_for_role(Role::ImplementationJudge, &text),
            VerdictSource::ImplementationJudge,
        ),
        Event::ModelFailed(err) => (
            Verdict::reject(format!("implementation judge failed: {err}")),
            VerdictSource::ModelFailure,
        ),
        other => return Err(unexpected("JudgingAttempt", &other)),
    };

    if verdict.is_accept() {
        record.step_mut(step)?.consecutive_failures = 0;
        return Ok(Phase::JudgingStep {
            step,
            attempt,
            has_diff,
            verdict,
        });
    }

    let attempt = Attempt {
        number: attempt.number,
        feedback: attempt.feedback,
        response: Some(attempt.response),
        has_diff,
        source,
        verdict,
        completion: None,
    };
    reject(limits, record, step, attempt, true)
}

/// Completion judge decides whether the accepted attempt finished the step.
pub(crate) fn on_step_judgment(
    limits: &Limits,
    record: &mut TaskRecord,
    step: usize,
    attempt: AttemptDraft,
    has_diff: bool,
    verdict: Verdict,
    event: Event,
) -> Result<Phase, TransitionError> {
    let (completion, counts_as_failure) = match event {
        Event::ModelReplied(text) => (
            parse_for_role(Role::CompletionJudge, &text),
            limits.completion_rejection_counts_as_failure,
        ),
        Event::ModelFailed(err) => (
            Verdict::reject(format!("completion judge failed: {err}")),
            true,
        ),
        other => return Err(unexpected("JudgingStep", &other)),
    };

    let accepted = completion.is_accept();
    let attempt = Attempt {
        number: attempt.number,
        feedback: attempt.feedback,
        response: Some(attempt.response),
        has_diff,
        source: VerdictSource::CompletionJudge,
        verdict,
        completion: Some(completion),
    };

    if accepted {
        let current = record.step_mut(step)?;
        current.attempts.push(attempt);
        current.status = StepStatus::Accepted;
        return Ok(Phase::CommittingStep { step });
    }
    reject(limits, record, step, attempt, counts_as_failure)
}

/// Record a rejected attempt, then retry with its rationale or abandon.
fn reject(
    limits: &Limits,
    record: &mut TaskRecord,
    step: usize,
    attempt: Attempt,
    counts_as_failure: bool,
) -> Result<Phase, TransitionError> {
    let rationale = attempt.final_verdict().rationale.clone();
    let current = record.step_mut(step)?;
    current.attempts.push(attempt);
    if counts_as_failure {
        current.consecutive_failures += 1;
    }

    if let Some(result) = limits.step_exhausted(current) {
        current.status = StepStatus::Abandoned;
        record.last_rationale = Some(rationale);
        return Ok(Phase::Finished(result));
    }
    record.last_rationale = Some(rationale.clone());
    Ok(Phase::RunningAttempt {
        step,
        feedback: Some(rationale),
    })
}
