//! Prompt rendering for the five model roles.
//!
//! Templates live in `prompts/*.md` and are compiled in. Every judge template
//! ends with the verdict vocabulary its parser understands, and the planner
//! template asks for [`PLAN_SENTINEL`].

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::machine::PlanFeedback;
use crate::core::plan::PLAN_SENTINEL;
use crate::core::types::{Role, Step};
use crate::io::config::OkConfig;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const PLAN_JUDGE_TEMPLATE: &str = include_str!("prompts/plan_judge.md");
const IMPLEMENTER_TEMPLATE: &str = include_str!("prompts/implementer.md");
const IMPLEMENTATION_JUDGE_TEMPLATE: &str = include_str!("prompts/implementation_judge.md");
const COMPLETION_JUDGE_TEMPLATE: &str = include_str!("prompts/completion_judge.md");

const NO_CHANGES: &str = "(no changes)";

/// Step fields the implementation prompts refer to.
#[derive(Debug, Clone, Serialize)]
pub struct StepContext {
    /// One-based position in the plan.
    pub number: usize,
    pub total: usize,
    pub description: String,
}

impl StepContext {
    pub fn from_step(step: &Step, total: usize) -> Self {
        Self {
            number: step.index + 1,
            total,
            description: step.description.trim().to_string(),
        }
    }
}

/// User-supplied text appended to each role's prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraPrompts {
    pub planner: String,
    pub plan_judge: String,
    pub implementer: String,
    pub implementation_judge: String,
    pub completion_judge: String,
}

impl ExtraPrompts {
    pub fn from_config(cfg: &OkConfig) -> Self {
        Self {
            planner: cfg.plan.planner_extra_prompt.clone(),
            plan_judge: cfg.plan.judge_extra_prompt.clone(),
            implementer: cfg.implement.extra_prompt.clone(),
            implementation_judge: cfg.implement.judge_extra_prompt.clone(),
            completion_judge: cfg.implement.completion.judge_extra_prompt.clone(),
        }
    }

    fn for_role(&self, role: Role) -> Option<&str> {
        let extra = match role {
            Role::Planner => &self.planner,
            Role::PlanJudge => &self.plan_judge,
            Role::Implementer => &self.implementer,
            Role::ImplementationJudge => &self.implementation_judge,
            Role::CompletionJudge => &self.completion_judge,
        };
        non_empty(extra)
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("plan_judge", PLAN_JUDGE_TEMPLATE)
            .expect("plan judge template should be valid");
        env.add_template("implementer", IMPLEMENTER_TEMPLATE)
            .expect("implementer template should be valid");
        env.add_template("implementation_judge", IMPLEMENTATION_JUDGE_TEMPLATE)
            .expect("implementation judge template should be valid");
        env.add_template("completion_judge", COMPLETION_JUDGE_TEMPLATE)
            .expect("completion judge template should be valid");
        Self { env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))?;
        Ok(rendered.trim_end().to_string())
    }
}

/// Renders role prompts with the configured extras and diff budget.
pub struct PromptBuilder {
    engine: PromptEngine,
    diff_budget_bytes: usize,
    extras: ExtraPrompts,
}

impl PromptBuilder {
    pub fn new(diff_budget_bytes: usize, extras: ExtraPrompts) -> Self {
        Self {
            engine: PromptEngine::new(),
            diff_budget_bytes,
            extras,
        }
    }

    pub fn from_config(cfg: &OkConfig) -> Self {
        Self::new(cfg.diff_budget_bytes, ExtraPrompts::from_config(cfg))
    }

    pub fn planner(&self, task: &str, feedback: Option<&PlanFeedback>) -> Result<String> {
        self.engine.render(
            "planner",
            context! {
                task => task.trim(),
                previous_plan => feedback.map(|f| f.previous_plan.trim()),
                feedback => feedback.map(|f| f.rationale.trim()),
                sentinel => PLAN_SENTINEL,
                extra => self.extras.for_role(Role::Planner),
            },
        )
    }

    pub fn plan_judge(&self, task: &str, plan: &str) -> Result<String> {
        self.engine.render(
            "plan_judge",
            context! {
                task => task.trim(),
                plan => plan.trim(),
                extra => self.extras.for_role(Role::PlanJudge),
            },
        )
    }

    pub fn implementer(
        &self,
        task: &str,
        plan: &str,
        step: &StepContext,
        attempt: u32,
        max_attempts: u32,
        feedback: Option<&str>,
    ) -> Result<String> {
        self.engine.render(
            "implementer",
            context! {
                task => task.trim(),
                plan => plan.trim(),
                step => step,
                attempt => attempt,
                max_attempts => max_attempts,
                feedback => feedback.and_then(non_empty),
                extra => self.extras.for_role(Role::Implementer),
            },
        )
    }

    pub fn implementation_judge(
        &self,
        task: &str,
        step: &StepContext,
        summary: &str,
        diff: &str,
    ) -> Result<String> {
        self.engine.render(
            "implementation_judge",
            context! {
                task => task.trim(),
                step => step,
                summary => summary.trim(),
                diff => self.bounded_diff(diff),
                extra => self.extras.for_role(Role::ImplementationJudge),
            },
        )
    }

    pub fn completion_judge(
        &self,
        task: &str,
        plan: &str,
        step: &StepContext,
        diff: &str,
    ) -> Result<String> {
        self.engine.render(
            "completion_judge",
            context! {
                task => task.trim(),
                plan => plan.trim(),
                step => step,
                diff => self.bounded_diff(diff),
                extra => self.extras.for_role(Role::CompletionJudge),
            },
        )
    }

    fn bounded_diff(&self, diff: &str) -> String {
        let diff = diff.trim_end();
        if diff.trim().is_empty() {
            return NO_CHANGES.to_string();
        }
        truncate_diff(diff, self.diff_budget_bytes)
    }
}

/// Cut `diff` to at most `budget` bytes on a char boundary, noting what was dropped.
fn truncate_diff(diff: &str, budget: usize) -> String {
    if diff.len() <= budget {
        return diff.to_string();
    }
    let mut cut = budget;
    while cut > 0 && !diff.is_char_boundary(cut) {
        cut -= 1;
    }
    let kept = &diff[..cut];
    debug!(
        before_len = diff.len(),
        after_len = kept.len(),
        "truncated diff for budget"
    );
    format!(
        "{kept}\n[diff truncated: showing {} of {} bytes]",
        kept.len(),
        diff.len()
    )
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
