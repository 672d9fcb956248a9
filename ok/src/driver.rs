//! Runs one task by alternating pure transitions with the effects they ask for.
//!
//! The state machine in [`crate::core::machine`] decides; this module only
//! performs the single effect each phase names and turns the outcome into an
//! event. The cancellation token is checked before and after every effect, so
//! an answer that arrives after an interrupt is dropped.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::Limits;
use crate::core::machine::{Effect, Event, Phase, TaskState, transition};
use crate::core::types::{Role, RunResult, TaskReport};
use crate::io::cancel::CancelToken;
use crate::io::config::{OkConfig, TaskSpec};
use crate::io::environment::{CommandError, Environment, Workspace};
use crate::io::history::TaskHistory;
use crate::io::model::{ModelGateway, ModelRequest};
use crate::io::prompt::{PromptBuilder, StepContext};

const MAX_SUBJECT_CHARS: usize = 72;

/// Knobs the driver needs from the effective configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    pub limits: Limits,
    pub run_timeout: Duration,
    pub llm_timeout: Duration,
    pub hook_command: Option<String>,
    pub check_command: Option<String>,
}

impl DriverSettings {
    pub fn from_config(cfg: &OkConfig) -> Self {
        Self {
            limits: cfg.limits(),
            run_timeout: cfg.run_timeout(),
            llm_timeout: cfg.llm_timeout(),
            hook_command: non_empty(&cfg.post_implementation_hook_command),
            check_command: non_empty(&cfg.post_implementation_check_command),
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            run_timeout: Duration::from_secs(120),
            llm_timeout: Duration::from_secs(300),
            hook_command: None,
            check_command: None,
        }
    }
}

/// Collaborators shared by every task of a run.
pub struct Driver<'a, G: ?Sized, E: ?Sized> {
    pub gateway: &'a G,
    pub environment: &'a E,
    pub prompts: &'a PromptBuilder,
    pub settings: &'a DriverSettings,
    pub cancel: &'a CancelToken,
}

impl<G: ModelGateway + ?Sized, E: Environment + ?Sized> Driver<'_, G, E> {
    /// Run `task` to a terminal result.
    ///
    /// The workspace is released however the task ends. `Err` is reserved for
    /// broken invariants (an event the state machine does not accept).
    #[instrument(skip_all, fields(number, task = %task.prompt))]
    pub fn run_task(
        &self,
        task: &TaskSpec,
        number: usize,
        mut history: Option<&mut TaskHistory>,
    ) -> Result<TaskReport> {
        let mut run = TaskRun {
            task,
            number,
            workspace: None,
            history: history.as_deref_mut(),
        };
        let outcome = self.drive(&mut run);
        let TaskRun { workspace, .. } = run;

        let mut last_commit = None;
        if let Some(workspace) = &workspace {
            last_commit = self
                .environment
                .head_commit(workspace)
                .inspect_err(|err| warn!(err = %err, "could not read final commit"))
                .ok()
                .filter(|sha| *sha != workspace.base_commit);
            if let Err(err) = self.environment.release_workspace(workspace) {
                warn!(err = %format!("{err:#}"), "failed to release workspace");
            }
        }
        let state = outcome?;

        let result = state
            .result()
            .ok_or_else(|| anyhow!("task stopped in phase {}", state.phase.name()))?;
        let record = state.record;
        let report = TaskReport {
            task: task.prompt.clone(),
            result,
            detail: match result {
                RunResult::Completed => None,
                _ => record.last_rationale,
            },
            base_commit: record.base_commit,
            branch: workspace.map(|ws| ws.branch),
            last_commit,
            planning: record.planning,
            plan: record.plan,
        };
        info!(result = %report.result, attempts = report.attempt_count(), "task finished");

        if let Some(history) = history {
            history.write_report(&report).context("write task history")?;
        }
        Ok(report)
    }

    fn drive(&self, run: &mut TaskRun<'_>) -> Result<TaskState> {
        let mut state = TaskState::new();
        while let Some(effect) = state.effect() {
            let event = if self.cancel.is_cancelled() {
                Event::Cancelled
            } else {
                let event = self.perform(effect, &state, run);
                if self.cancel.is_cancelled() {
                    Event::Cancelled
                } else {
                    event
                }
            };
            let from = state.phase.name();
            let event_name = event.name();
            state = transition(&self.settings.limits, state, event)
                .with_context(|| format!("apply {event_name} in {from}"))?;
            debug!(
                from,
                event = event_name,
                to = state.phase.name(),
                step = ?state.current_step(),
                "transition"
            );
        }
        Ok(state)
    }

    fn perform(&self, effect: Effect, state: &TaskState, run: &mut TaskRun<'_>) -> Event {
        if let Effect::PrepareWorkspace = effect {
            return self.prepare(run);
        }
        self.perform_in_workspace(effect, state, run)
            .unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "effect failed");
                Event::EffectFailed(format!("{err:#}"))
            })
    }

    fn prepare(&self, run: &mut TaskRun<'_>) -> Event {
        match self
            .environment
            .create_isolated_workspace(run.task, run.number)
        {
            Ok(workspace) => {
                let base_commit = workspace.base_commit.clone();
                run.workspace = Some(workspace);
                Event::WorkspaceReady { base_commit }
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "workspace setup failed");
                Event::SetupFailed(format!("{err:#}"))
            }
        }
    }

    fn perform_in_workspace(
        &self,
        effect: Effect,
        state: &TaskState,
        run: &mut TaskRun<'_>,
    ) -> Result<Event> {
        let workspace = run
            .workspace
            .as_ref()
            .context("no workspace for this task")?;
        match effect {
            Effect::PrepareWorkspace => bail!("workspace already prepared"),
            Effect::BeginStep(step) => {
                info!(
                    step = step + 1,
                    total = state.record.step_count(),
                    "starting step"
                );
                Ok(Event::StepStarted)
            }
            Effect::Invoke(role) => {
                self.invoke(role, state, run.task, workspace, run.history.as_deref_mut())
            }
            Effect::RunHook => Ok(self.run_hook(workspace)),
            Effect::RunCheck => self.run_check(workspace),
            Effect::CommitStep(step) => self.commit_step(step, state, workspace),
            Effect::FinalizeTask => self.finalize(run.task, workspace),
        }
    }

    fn invoke(
        &self,
        role: Role,
        state: &TaskState,
        task: &TaskSpec,
        workspace: &Workspace,
        history: Option<&mut TaskHistory>,
    ) -> Result<Event> {
        let prompt = self.build_prompt(role, state, task, workspace)?;
        let request = ModelRequest {
            role,
            prompt,
            workdir: workspace.root.clone(),
            timeout: self.settings.llm_timeout,
            transcript_path: history.map(|h| h.next_transcript(role)),
        };
        Ok(match self.gateway.invoke(&request) {
            Ok(response) => Event::ModelReplied(response),
            Err(err) => Event::ModelFailed(err),
        })
    }

    fn build_prompt(
        &self,
        role: Role,
        state: &TaskState,
        task: &TaskSpec,
        workspace: &Workspace,
    ) -> Result<String> {
        let record = &state.record;
        let plan_text = record.plan().map_or("", |plan| plan.text.as_str());
        let step_context = |index: usize| -> Result<StepContext> {
            Ok(StepContext::from_step(
                record.step(index)?,
                record.step_count(),
            ))
        };
        match &state.phase {
            Phase::Drafting { feedback } => self.prompts.planner(&task.prompt, feedback.as_ref()),
            Phase::AwaitingJudgment { draft, .. } => {
                self.prompts.plan_judge(&task.prompt, &draft.text)
            }
            Phase::RunningAttempt { step, feedback } => {
                let attempt = record.step(*step)?.attempts_started + 1;
                self.prompts.implementer(
                    &task.prompt,
                    plan_text,
                    &step_context(*step)?,
                    attempt,
                    self.settings.limits.max_implementation_attempts,
                    feedback.as_deref(),
                )
            }
            Phase::JudgingAttempt { step, attempt, .. } => {
                let diff = self.environment.diff(workspace).context("diff for judge")?;
                self.prompts.implementation_judge(
                    &task.prompt,
                    &step_context(*step)?,
                    &attempt.response,
                    &diff,
                )
            }
            Phase::JudgingStep { step, .. } => {
                let diff = self.environment.diff(workspace).context("diff for judge")?;
                self.prompts
                    .completion_judge(&task.prompt, plan_text, &step_context(*step)?, &diff)
            }
            other => bail!("no {role} prompt in phase {}", other.name()),
        }
    }

    /// The hook's outcome never decides anything; a failure is only logged.
    fn run_hook(&self, workspace: &Workspace) -> Event {
        let Some(cmd) = self.settings.hook_command.as_deref() else {
            return Event::HookFinished { success: true };
        };
        info!(cmd, "running post-implementation hook");
        match self
            .environment
            .run_command(cmd, &workspace.root, self.settings.run_timeout)
        {
            Ok(out) => {
                if !out.success {
                    warn!(exit_code = ?out.exit_code, "post-implementation hook failed");
                }
                Event::HookFinished {
                    success: out.success,
                }
            }
            Err(CommandError::Cancelled) => Event::Cancelled,
            Err(err) => {
                warn!(err = %err, "post-implementation hook did not finish");
                Event::HookFinished { success: false }
            }
        }
    }

    fn run_check(&self, workspace: &Workspace) -> Result<Event> {
        let (passed, output) = match self.settings.check_command.as_deref() {
            None => (true, String::new()),
            Some(cmd) => {
                info!(cmd, "running post-implementation check");
                match self
                    .environment
                    .run_command(cmd, &workspace.root, self.settings.run_timeout)
                {
                    Ok(out) => {
                        debug!(exit_code = ?out.exit_code, passed = out.success, "check finished");
                        (out.success, out.output)
                    }
                    Err(CommandError::Cancelled) => return Ok(Event::Cancelled),
                    Err(err) => (false, err.to_string()),
                }
            }
        };
        let has_diff = self
            .environment
            .has_uncommitted_changes(workspace)
            .context("inspect working tree")?;
        Ok(Event::CheckFinished {
            passed,
            output,
            has_diff,
        })
    }

    fn commit_step(&self, step: usize, state: &TaskState, workspace: &Workspace) -> Result<Event> {
        let record = &state.record;
        let description = &record.step(step)?.description;
        let message = format!(
            "ok: step {}/{}: {}",
            step + 1,
            record.step_count(),
            subject_line(description)
        );
        let committed = self
            .environment
            .commit(workspace, &message)
            .with_context(|| format!("commit step {}", step + 1))?;
        info!(step = step + 1, committed, "step accepted");
        Ok(Event::StepCommitted)
    }

    fn finalize(&self, task: &TaskSpec, workspace: &Workspace) -> Result<Event> {
        let has_changes = self
            .environment
            .has_uncommitted_changes(workspace)
            .context("inspect working tree")?;
        if has_changes {
            let message = format!("ok: finish task: {}", subject_line(&task.prompt));
            self.environment
                .commit(workspace, &message)
                .context("commit leftover changes")?;
        }
        Ok(Event::Finalized { has_changes })
    }
}

/// Per-task mutable state outside the machine: the workspace and history.
struct TaskRun<'a> {
    task: &'a TaskSpec,
    number: usize,
    workspace: Option<Workspace>,
    history: Option<&'a mut TaskHistory>,
}

/// First line of `text`, cut to a commit subject length.
fn subject_line(text: &str) -> String {
    let first = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first.chars().count() <= MAX_SUBJECT_CHARS {
        return first.to_string();
    }
    let mut cut: String = first.chars().take(MAX_SUBJECT_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
