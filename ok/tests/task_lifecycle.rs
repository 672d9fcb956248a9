//! Task-level tests driving `Driver::run_task` with scripted collaborators.
//!
//! Every model answer and shell result is scripted, so each test pins down
//! exactly which roles were called, in which order, and what the task
//! reported at the end.

use std::path::Path;

use ok::core::error::ModelError;
use ok::core::implementation::CHECK_FAILED;
use ok::core::types::{PlanStatus, Role, RunResult, StepStatus, TaskReport, VerdictSource};
use ok::driver::{Driver, DriverSettings};
use ok::io::cancel::CancelToken;
use ok::io::environment::CommandError;
use ok::io::prompt::{ExtraPrompts, PromptBuilder};
use ok::test_support::{
    SCRIPTED_HEAD, ScriptedEnvironment, ScriptedGateway, ScriptedReply, shell, task,
};

const PLAN: &str = "1. Write notes\n2. Review notes\nThis is the end of the plan";
const ONE_STEP_PLAN: &str = "1. Write notes\nThis is the end of the plan";
const APPROVE: &str = "I am the plan judge.\n\nFeedback: fine.\n\nVerdict: APPROVED APPROVED APPROVED, end of plan review.";
const REJECT_PLAN: &str = "Missing tests.\nREJECTED REJECTED REJECTED";
const SUCCESS: &str = "Good progress.\nSUCCESS";
const FAILURE: &str = "Broken build.\nFAILURE";
const COMPLETE: &str = "All there.\nCOMPLETE";
const CONTINUE: &str = "Notes are empty.\nCONTINUE";

fn settings() -> DriverSettings {
    DriverSettings::default()
}

fn run(
    gateway: &ScriptedGateway,
    environment: &ScriptedEnvironment,
    settings: &DriverSettings,
    cancel: &CancelToken,
) -> TaskReport {
    let prompts = PromptBuilder::new(10_000, ExtraPrompts::default());
    let driver = Driver {
        gateway,
        environment,
        prompts: &prompts,
        settings,
        cancel,
    };
    driver
        .run_task(&task("Add notes", Path::new("/repo")), 1, None)
        .expect("run task")
}

fn approved(gateway: ScriptedGateway, plan: &str) -> ScriptedGateway {
    gateway
        .texts(Role::Planner, [plan])
        .texts(Role::PlanJudge, [APPROVE])
}

#[test]
fn two_step_plan_completes_with_one_commit_per_step() {
    let gateway = approved(ScriptedGateway::new(), PLAN)
        .texts(Role::Implementer, ["wrote notes", "reviewed notes"])
        .texts(Role::ImplementationJudge, [SUCCESS, SUCCESS])
        .texts(Role::CompletionJudge, [COMPLETE, COMPLETE]);
    let env = ScriptedEnvironment::new();

    let report = run(&gateway, &env, &settings(), &CancelToken::new());

    assert_eq!(report.result, RunResult::Completed);
    assert_eq!(report.detail, None);
    assert_eq!(
        gateway.roles(),
        vec![
            Role::Planner,
            Role::PlanJudge,
            Role::Implementer,
            Role::ImplementationJudge,
            Role::CompletionJudge,
            Role::Implementer,
            Role::ImplementationJudge,
            Role::CompletionJudge,
        ]
    );
    let commits = env.commits();
    assert_eq!(commits[0], "ok: step 1/2: Write notes");
    assert_eq!(commits[1], "ok: step 2/2: Review notes");
    assert_eq!(report.branch.as_deref(), Some("ok/task-1"));
    assert_eq!(report.last_commit.as_deref(), Some(SCRIPTED_HEAD));
    assert_eq!(env.released(), 1);

    let plan = report.plan.as_ref().expect("approved plan");
    assert_eq!(plan.status, PlanStatus::Approved);
    assert!(plan.steps.iter().all(|s| s.status == StepStatus::Accepted));
    assert_eq!(report.attempt_count(), 2);
    assert_eq!(gateway.unused(), 0);
}

#[test]
fn rejected_plan_is_redrafted_with_feedback() {
    let gateway = ScriptedGateway::new()
        .texts(Role::Planner, ["1. Vague idea", ONE_STEP_PLAN])
        .texts(Role::PlanJudge, [REJECT_PLAN, APPROVE])
        .texts(Role::Implementer, ["done"])
        .texts(Role::ImplementationJudge, [SUCCESS])
        .texts(Role::CompletionJudge, [COMPLETE]);
    let env = ScriptedEnvironment::new();

    let report = run(&gateway, &env, &settings(), &CancelToken::new());

    assert_eq!(report.result, RunResult::Completed);
    assert_eq!(gateway.count(Role::Planner), 2);
    assert_eq!(gateway.count(Role::PlanJudge), 2);
    let planner_calls: Vec<_> = gateway
        .calls()
        .into_iter()
        .filter(|c| c.role == Role::Planner)
        .collect();
    assert!(!planner_calls[0].prompt.contains("Missing tests."));
    assert!(planner_calls[1].prompt.contains("1. Vague idea"));
    assert!(planner_calls[1].prompt.contains("Missing tests."));

    assert_eq!(report.planning.len(), 2);
    assert_eq!(
        report.planning[0].plan.status,
        PlanStatus::Rejected("Missing tests.".to_string())
    );
    assert_eq!(report.planning[1].plan.status, PlanStatus::Approved);
}

#[test]
fn planning_rounds_run_out() {
    let gateway = ScriptedGateway::new()
        .texts(Role::Planner, [PLAN, PLAN])
        .texts(Role::PlanJudge, [REJECT_PLAN, REJECT_PLAN]);
    let env = ScriptedEnvironment::new();
    let mut settings = settings();
    settings.limits.max_planning_rounds = 2;

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    assert_eq!(report.result, RunResult::AbandonedAfterMaxAttempts);
    assert_eq!(report.detail.as_deref(), Some("Missing tests."));
    assert_eq!(gateway.count(Role::Implementer), 0);
    assert!(report.plan.is_none());
    assert_eq!(env.released(), 1);
}

#[test]
fn planner_failures_abandon_the_task() {
    let gateway = ScriptedGateway::new().on(
        Role::Planner,
        [
            ScriptedReply::Fail(ModelError::EmptyResponse),
            ScriptedReply::text("no list, just prose is fine"),
            ScriptedReply::Fail(ModelError::ProcessFailure { exit_code: Some(1) }),
            ScriptedReply::Fail(ModelError::EmptyResponse),
        ],
    )
    .texts(Role::PlanJudge, [REJECT_PLAN]);
    let env = ScriptedEnvironment::new();
    let mut settings = settings();
    settings.limits.max_consecutive_failures = 2;

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    // The prose draft was judged, which reset the failure streak.
    assert_eq!(report.result, RunResult::AbandonedAfterConsecutiveFailures);
    assert_eq!(gateway.count(Role::Planner), 4);
    assert_eq!(gateway.count(Role::PlanJudge), 1);
    assert_eq!(gateway.unused(), 0);
    assert!(
        report
            .detail
            .as_deref()
            .is_some_and(|d| d.starts_with("planner failed"))
    );
}

#[test]
fn attempts_run_out_after_repeated_rejections() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["try 1", "try 2", "try 3"])
        .texts(Role::ImplementationJudge, [FAILURE, FAILURE, FAILURE]);
    let env = ScriptedEnvironment::new();
    let mut settings = settings();
    settings.limits.max_implementation_attempts = 3;
    settings.limits.max_consecutive_failures = 10;

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    assert_eq!(report.result, RunResult::AbandonedAfterMaxAttempts);
    assert_eq!(report.attempt_count(), 3);
    assert_eq!(gateway.count(Role::Implementer), 3);
    assert_eq!(gateway.count(Role::CompletionJudge), 0);
    assert_eq!(report.detail.as_deref(), Some("Broken build."));

    let implementer_prompts: Vec<String> = gateway
        .calls()
        .into_iter()
        .filter(|c| c.role == Role::Implementer)
        .map(|c| c.prompt)
        .collect();
    assert!(implementer_prompts[0].contains("attempt #1 out of 3"));
    assert!(!implementer_prompts[0].contains("Broken build."));
    assert!(implementer_prompts[2].contains("attempt #3 out of 3"));
    assert!(implementer_prompts[2].contains("Broken build."));

    let step = &report.plan.as_ref().expect("plan").steps[0];
    assert_eq!(step.status, StepStatus::Abandoned);
    let numbers: Vec<u32> = step.attempts.iter().map(|a| a.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(env.commits().iter().all(|c| !c.starts_with("ok: step")));
}

#[test]
fn consecutive_failures_stop_before_the_attempt_budget() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["try 1", "try 2"])
        .texts(Role::ImplementationJudge, [FAILURE, FAILURE]);
    let env = ScriptedEnvironment::new();
    let mut settings = settings();
    settings.limits.max_consecutive_failures = 2;

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    assert_eq!(report.result, RunResult::AbandonedAfterConsecutiveFailures);
    assert_eq!(report.attempt_count(), 2);
}

#[test]
fn failing_check_rejects_without_asking_the_judge() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["first", "second"])
        .texts(Role::ImplementationJudge, [SUCCESS])
        .texts(Role::CompletionJudge, [COMPLETE]);
    let env = ScriptedEnvironment::new()
        .shell_results([shell(1, "test notes_exist ... FAILED"), shell(0, "ok")]);
    let mut settings = settings();
    settings.check_command = Some("cargo test".to_string());

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    assert_eq!(report.result, RunResult::Completed);
    assert_eq!(gateway.count(Role::Implementer), 2);
    assert_eq!(gateway.count(Role::ImplementationJudge), 1);
    assert_eq!(env.commands(), vec!["cargo test", "cargo test"]);

    let attempts = &report.plan.as_ref().expect("plan").steps[0].attempts;
    assert_eq!(attempts[0].source, VerdictSource::CheckCommand);
    assert!(attempts[0].verdict.rationale.starts_with(CHECK_FAILED));
    assert!(attempts[0].verdict.rationale.contains("notes_exist"));
    assert_eq!(attempts[1].source, VerdictSource::CompletionJudge);

    let second = gateway
        .calls()
        .into_iter()
        .filter(|c| c.role == Role::Implementer)
        .nth(1)
        .expect("second attempt");
    assert!(second.prompt.contains("notes_exist ... FAILED"));
}

#[test]
fn check_timeout_counts_as_failed_check() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["first"]);
    let env = ScriptedEnvironment::new().shell_results([Err(CommandError::Timeout(
        std::time::Duration::from_secs(120),
    ))]);
    let mut settings = settings();
    settings.check_command = Some("sleep 999".to_string());
    settings.limits.max_consecutive_failures = 1;

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    assert_eq!(report.result, RunResult::AbandonedAfterConsecutiveFailures);
    assert!(
        report
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("timed out"))
    );
}

#[test]
fn hook_runs_every_attempt_and_never_blocks() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["first", "second"])
        .texts(Role::ImplementationJudge, [FAILURE, SUCCESS])
        .texts(Role::CompletionJudge, [COMPLETE]);
    let env = ScriptedEnvironment::new().shell_results([shell(2, "fmt broke"), shell(0, "")]);
    let mut settings = settings();
    settings.hook_command = Some("cargo fmt".to_string());

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    assert_eq!(report.result, RunResult::Completed);
    assert_eq!(env.commands(), vec!["cargo fmt", "cargo fmt"]);
    assert_eq!(gateway.count(Role::ImplementationJudge), 2);
}

#[test]
fn completion_rejection_spends_an_attempt() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["half", "rest"])
        .texts(Role::ImplementationJudge, [SUCCESS, SUCCESS])
        .texts(Role::CompletionJudge, [CONTINUE, COMPLETE]);
    let env = ScriptedEnvironment::new();

    let report = run(&gateway, &env, &settings(), &CancelToken::new());

    assert_eq!(report.result, RunResult::Completed);
    let step = &report.plan.as_ref().expect("plan").steps[0];
    assert_eq!(step.attempts.len(), 2);
    assert!(step.attempts[0].verdict.is_accept());
    assert!(!step.attempts[0].final_verdict().is_accept());
    assert_eq!(step.consecutive_failures, 0);

    let second = gateway
        .calls()
        .into_iter()
        .filter(|c| c.role == Role::Implementer)
        .nth(1)
        .expect("second attempt");
    assert!(second.prompt.contains("Notes are empty."));
}

#[test]
fn implementer_failure_is_a_rejected_attempt() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN).on(
        Role::Implementer,
        [ScriptedReply::Fail(ModelError::Timeout(
            std::time::Duration::from_secs(300),
        ))],
    );
    let env = ScriptedEnvironment::new();
    let mut settings = settings();
    settings.limits.max_consecutive_failures = 1;

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    assert_eq!(report.result, RunResult::AbandonedAfterConsecutiveFailures);
    let attempt = &report.plan.as_ref().expect("plan").steps[0].attempts[0];
    assert_eq!(attempt.source, VerdictSource::ModelFailure);
    assert_eq!(attempt.response, None);
    assert_eq!(gateway.count(Role::ImplementationJudge), 0);
}

#[test]
fn cancellation_during_a_call_discards_its_answer() {
    let cancel = CancelToken::new();
    let gateway = ScriptedGateway::new()
        .with_cancel(&cancel)
        .texts(Role::Planner, [PLAN])
        .on(
            Role::PlanJudge,
            [ScriptedReply::CancelDuring(APPROVE.to_string())],
        );
    let env = ScriptedEnvironment::new();

    let report = run(&gateway, &env, &settings(), &cancel);

    assert_eq!(report.result, RunResult::Cancelled);
    assert!(report.plan.is_none());
    assert_eq!(gateway.count(Role::Implementer), 0);
    assert_eq!(env.released(), 1);
}

#[test]
fn cancelled_before_start_touches_nothing() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let gateway = ScriptedGateway::new();
    let env = ScriptedEnvironment::new();

    let report = run(&gateway, &env, &settings(), &cancel);

    assert_eq!(report.result, RunResult::Cancelled);
    assert!(gateway.calls().is_empty());
    assert_eq!(env.created(), 0);
    assert_eq!(env.released(), 0);
}

#[test]
fn cancelled_check_cancels_the_task() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["first"]);
    let env = ScriptedEnvironment::new().shell_results([Err(CommandError::Cancelled)]);
    let mut settings = settings();
    settings.check_command = Some("cargo test".to_string());

    let report = run(&gateway, &env, &settings, &CancelToken::new());

    assert_eq!(report.result, RunResult::Cancelled);
    assert_eq!(gateway.count(Role::ImplementationJudge), 0);
}

#[test]
fn setup_failure_is_a_configuration_error() {
    let gateway = ScriptedGateway::new();
    let env = ScriptedEnvironment::new().failing_setup("base revision 'nope' did not resolve");

    let report = run(&gateway, &env, &settings(), &CancelToken::new());

    assert_eq!(report.result, RunResult::ConfigurationError);
    assert!(
        report
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("nope"))
    );
    assert!(gateway.calls().is_empty());
    assert_eq!(env.released(), 0);
}

#[test]
fn commit_failure_is_a_configuration_error() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["done"])
        .texts(Role::ImplementationJudge, [SUCCESS])
        .texts(Role::CompletionJudge, [COMPLETE]);
    let env = ScriptedEnvironment::new().failing_commits("index.lock exists");

    let report = run(&gateway, &env, &settings(), &CancelToken::new());

    assert_eq!(report.result, RunResult::ConfigurationError);
    assert!(
        report
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("index.lock"))
    );
    assert_eq!(env.released(), 1);
}

#[test]
fn judges_see_the_workspace_diff() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["wrote notes.txt"])
        .texts(Role::ImplementationJudge, [SUCCESS])
        .texts(Role::CompletionJudge, [COMPLETE]);
    let env = ScriptedEnvironment::new();

    run(&gateway, &env, &settings(), &CancelToken::new());

    for call in gateway.calls() {
        if matches!(call.role, Role::ImplementationJudge | Role::CompletionJudge) {
            assert!(call.prompt.contains("+hello"), "{} prompt has the diff", call.role);
        }
        assert_eq!(call.workdir, Path::new("/scripted/workspace"));
    }
}

#[test]
fn step_without_changes_completes_without_a_commit() {
    let gateway = approved(ScriptedGateway::new(), ONE_STEP_PLAN)
        .texts(Role::Implementer, ["nothing to change"])
        .texts(Role::ImplementationJudge, [SUCCESS])
        .texts(Role::CompletionJudge, [COMPLETE]);
    let env = ScriptedEnvironment::new().with_changes(false);

    let report = run(&gateway, &env, &settings(), &CancelToken::new());

    assert_eq!(report.result, RunResult::Completed);
    assert_eq!(env.commits(), vec!["ok: step 1/1: Write notes".to_string()]);
    assert_eq!(report.last_commit, None);
    let plan = report.plan.as_ref().expect("approved plan");
    assert!(!plan.steps[0].attempts[0].has_diff);
    assert!(gateway.calls()[3].prompt.contains("(no changes)"));
}
