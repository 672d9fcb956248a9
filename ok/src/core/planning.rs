//! Planning cycle: draft, judge, redraft until approved or out of rounds.

use crate::core::budget::Limits;
use crate::core::error::{ModelError, TransitionError};
use crate::core::machine::{Event, Phase, PlanFeedback, TaskRecord, unexpected};
use crate::core::plan::parse_plan;
use crate::core::types::{Plan, PlanRound, PlanStatus, Role, RunResult};
use crate::core::verdict::parse_for_role;

/// Planner answered (or failed) while drafting.
pub(crate) fn on_draft(
    limits: &Limits,
    record: &mut TaskRecord,
    feedback: Option<PlanFeedback>,
    event: Event,
) -> Result<Phase, TransitionError> {
    match event {
        Event::ModelReplied(text) => {
            let draft = parse_plan(&text);
            if draft.steps.is_empty() {
                return Ok(planning_failure(
                    limits,
                    record,
                    "planner",
                    &ModelError::EmptyResponse,
                    Phase::Drafting { feedback },
                ));
            }
            Ok(Phase::AwaitingJudgment { draft, feedback })
        }
        Event::ModelFailed(err) => Ok(planning_failure(
            limits,
            record,
            "planner",
            &err,
            Phase::Drafting { feedback },
        )),
        other => Err(unexpected("Drafting", &other)),
    }
}

/// Plan judge answered (or failed) on a draft.
pub(crate) fn on_judgment(
    limits: &Limits,
    record: &mut TaskRecord,
    mut draft: Plan,
    feedback: Option<PlanFeedback>,
    event: Event,
) -> Result<Phase, TransitionError> {
    let text = match event {
        Event::ModelReplied(text) => text,
        // The draft itself was fine; ask the judge again.
        Event::ModelFailed(err) => {
            return Ok(planning_failure(
                limits,
                record,
                "plan judge",
                &err,
                Phase::AwaitingJudgment { draft, feedback },
            ));
        }
        other => return Err(unexpected("AwaitingJudgment", &other)),
    };

    let verdict = parse_for_role(Role::PlanJudge, &text);
    record.planning_failures = 0;
    record.planning_rounds += 1;

    if verdict.is_accept() {
        draft.status = PlanStatus::Approved;
        record.planning.push(PlanRound {
            round: record.planning_rounds,
            plan: draft.clone(),
            verdict,
        });
        record.plan = Some(draft);
        return Ok(Phase::StartingStep { step: 0 });
    }

    let rationale = verdict.rationale.clone();
    draft.status = PlanStatus::Rejected(rationale.clone());
    let previous_plan = draft.text.clone();
    record.planning.push(PlanRound {
        round: record.planning_rounds,
        plan: draft,
        verdict,
    });
    record.last_rationale = Some(rationale.clone());

    if limits.planning_rounds_exhausted(record.planning_rounds) {
        return Ok(Phase::Finished(RunResult::AbandonedAfterMaxAttempts));
    }
    Ok(Phase::Drafting {
        feedback: Some(PlanFeedback {
            previous_plan,
            rationale,
        }),
    })
}

fn planning_failure(
    limits: &Limits,
    record: &mut TaskRecord,
    who: &str,
    err: &ModelError,
    retry: Phase,
) -> Phase {
    record.planning_failures += 1;
    record.last_rationale = Some(format!("{who} failed: {err}"));
    if limits.planning_failures_exhausted(record.planning_failures) {
        Phase::Finished(RunResult::AbandonedAfterConsecutiveFailures)
    } else {
        retry
    }
}
