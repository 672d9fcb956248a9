//! Configuration stored in `.ok.toml` next to the repository.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::Limits;

pub const CONFIG_FILE_NAME: &str = ".ok.toml";

/// Which model CLI answers every role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    #[default]
    Gemini,
    Claude,
    Codex,
    Openrouter,
    Opencode,
    Mock,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Gemini => "gemini",
            Engine::Claude => "claude",
            Engine::Codex => "codex",
            Engine::Openrouter => "openrouter",
            Engine::Opencode => "opencode",
            Engine::Mock => "mock",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `ok` configuration (TOML, kebab-case keys).
///
/// Every field has a default so an absent file and an empty file behave the
/// same. Command-line flags are layered on top with [`OkConfig::apply`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct OkConfig {
    /// Limit for shell commands (hook, check, git), excluding model calls.
    pub run_timeout_seconds: u64,
    pub llm_timeout_seconds: u64,
    /// Bytes of stdout/stderr kept in memory per child process.
    pub output_limit_bytes: usize,
    /// Bytes of diff shown to judges before truncating.
    pub diff_budget_bytes: usize,
    /// Root for session history. Defaults to `~/.ok`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Shell command run after each implementation attempt, e.g. `cargo fmt`.
    pub post_implementation_hook_command: String,
    /// Shell command whose failure rejects an attempt with its output as feedback.
    pub post_implementation_check_command: String,
    /// Default working directory for tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Default base revision for tasks.
    pub base: String,
    /// Work in the repository itself instead of a temporary worktree.
    pub no_worktree: bool,
    pub llm: LlmConfig,
    pub plan: PlanConfig,
    pub implement: ImplementConfig,
    pub mock_cfg: MockConfig,
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct LlmConfig {
    pub engine: Engine,
    /// Model name passed to the engine. `pro`/`flash` are gemini shortcuts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Let the model CLI edit files and run commands without asking.
    pub allow_unsafe: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            engine: Engine::default(),
            model: None,
            allow_unsafe: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct PlanConfig {
    pub max_planning_rounds: u32,
    pub planner_extra_prompt: String,
    pub judge_extra_prompt: String,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            max_planning_rounds: 5,
            planner_extra_prompt: String::new(),
            judge_extra_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ImplementConfig {
    pub max_implementation_attempts: u32,
    pub max_consecutive_failures: u32,
    pub extra_prompt: String,
    pub judge_extra_prompt: String,
    pub completion: CompletionConfig,
}

impl Default for ImplementConfig {
    fn default() -> Self {
        Self {
            max_implementation_attempts: 10,
            max_consecutive_failures: 3,
            extra_prompt: String::new(),
            judge_extra_prompt: String::new(),
            completion: CompletionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct CompletionConfig {
    pub judge_extra_prompt: String,
    /// Count a completion-judge rejection as a consecutive failure.
    pub rejection_counts_as_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct MockConfig {
    /// Seconds each mock call sleeps before answering.
    pub delay: u64,
    /// TOML file with `[[prompts]]` regex/response pairs.
    pub file: PathBuf,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            delay: 5,
            file: PathBuf::from("mock_llm_data.toml"),
        }
    }
}

/// One `[[tasks]]` entry. Unset fields fall back to the top-level values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TaskConfig {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_worktree: Option<bool>,
}

impl TaskConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            cwd: None,
            base: None,
            no_worktree: None,
        }
    }
}

/// A task with every default resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub prompt: String,
    pub cwd: PathBuf,
    pub base: String,
    pub no_worktree: bool,
}

impl Default for OkConfig {
    fn default() -> Self {
        Self {
            run_timeout_seconds: 120,
            llm_timeout_seconds: 300,
            output_limit_bytes: 1_000_000,
            diff_budget_bytes: 60_000,
            state_dir: None,
            post_implementation_hook_command: String::new(),
            post_implementation_check_command: String::new(),
            cwd: None,
            base: "HEAD".to_string(),
            no_worktree: false,
            llm: LlmConfig::default(),
            plan: PlanConfig::default(),
            implement: ImplementConfig::default(),
            mock_cfg: MockConfig::default(),
            tasks: Vec::new(),
        }
    }
}

/// Values given on the command line. `None`/empty means "keep the file value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub engine: Option<Engine>,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub base: Option<String>,
    pub no_worktree: bool,
    pub max_planning_rounds: Option<u32>,
    pub max_implementation_attempts: Option<u32>,
    pub max_consecutive_failures: Option<u32>,
    pub post_implementation_hook_command: Option<String>,
    pub post_implementation_check_command: Option<String>,
    pub prompts: Vec<String>,
}

impl OkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run_timeout_seconds == 0 {
            return Err(anyhow!("run-timeout-seconds must be > 0"));
        }
        if self.llm_timeout_seconds == 0 {
            return Err(anyhow!("llm-timeout-seconds must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output-limit-bytes must be > 0"));
        }
        if self.diff_budget_bytes == 0 {
            return Err(anyhow!("diff-budget-bytes must be > 0"));
        }
        if self.plan.max_planning_rounds == 0 {
            return Err(anyhow!("plan.max-planning-rounds must be > 0"));
        }
        if self.implement.max_implementation_attempts == 0 {
            return Err(anyhow!("implement.max-implementation-attempts must be > 0"));
        }
        if self.implement.max_consecutive_failures == 0 {
            return Err(anyhow!("implement.max-consecutive-failures must be > 0"));
        }
        if self.base.trim().is_empty() {
            return Err(anyhow!("base must not be empty"));
        }
        if self
            .llm
            .model
            .as_deref()
            .is_some_and(|m| m.trim().is_empty())
        {
            return Err(anyhow!("llm.model must not be empty when set"));
        }
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.prompt.trim().is_empty() {
                return Err(anyhow!("tasks[{idx}].prompt must not be empty"));
            }
            if task.base.as_deref().is_some_and(|b| b.trim().is_empty()) {
                return Err(anyhow!("tasks[{idx}].base must not be empty when set"));
            }
        }
        Ok(())
    }

    /// Layer command-line values over the file values.
    pub fn apply(&mut self, overrides: Overrides) -> Result<()> {
        if !overrides.prompts.is_empty() && !self.tasks.is_empty() {
            return Err(anyhow!(
                "cannot combine [[tasks]] in the config file with task prompts on the command line"
            ));
        }
        if let Some(engine) = overrides.engine {
            self.llm.engine = engine;
        }
        if overrides.model.is_some() {
            self.llm.model = overrides.model;
        }
        if overrides.cwd.is_some() {
            self.cwd = overrides.cwd;
        }
        if let Some(base) = overrides.base {
            self.base = base;
        }
        if overrides.no_worktree {
            self.no_worktree = true;
        }
        if let Some(value) = overrides.max_planning_rounds {
            self.plan.max_planning_rounds = value;
        }
        if let Some(value) = overrides.max_implementation_attempts {
            self.implement.max_implementation_attempts = value;
        }
        if let Some(value) = overrides.max_consecutive_failures {
            self.implement.max_consecutive_failures = value;
        }
        if let Some(cmd) = overrides.post_implementation_hook_command {
            self.post_implementation_hook_command = cmd;
        }
        if let Some(cmd) = overrides.post_implementation_check_command {
            self.post_implementation_check_command = cmd;
        }
        if !overrides.prompts.is_empty() {
            self.tasks = overrides.prompts.into_iter().map(TaskConfig::new).collect();
        }
        Ok(())
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_planning_rounds: self.plan.max_planning_rounds,
            max_implementation_attempts: self.implement.max_implementation_attempts,
            max_consecutive_failures: self.implement.max_consecutive_failures,
            completion_rejection_counts_as_failure: self
                .implement
                .completion
                .rejection_counts_as_failure,
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_seconds)
    }

    /// Session history root: `state-dir`, else `~/.ok`, else a temp directory.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(".ok"))
            .unwrap_or_else(|| std::env::temp_dir().join("ok"))
    }

    /// Resolve per-task values against the top-level defaults.
    pub fn resolve_tasks(&self, invocation_dir: &Path) -> Vec<TaskSpec> {
        let default_cwd = match &self.cwd {
            Some(cwd) => invocation_dir.join(cwd),
            None => invocation_dir.to_path_buf(),
        };
        self.tasks
            .iter()
            .map(|task| TaskSpec {
                prompt: task.prompt.clone(),
                cwd: task
                    .cwd
                    .as_ref()
                    .map_or_else(|| default_cwd.clone(), |cwd| invocation_dir.join(cwd)),
                base: task.base.clone().unwrap_or_else(|| self.base.clone()),
                no_worktree: task.no_worktree.unwrap_or(self.no_worktree),
            })
            .collect()
    }

    pub fn to_toml(&self) -> Result<String> {
        let mut buf = toml::to_string_pretty(self).context("serialize config toml")?;
        if !buf.ends_with('\n') {
            buf.push('\n');
        }
        Ok(buf)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OkConfig::default()`.
pub fn load_config(path: &Path) -> Result<OkConfig> {
    if !path.exists() {
        let cfg = OkConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OkConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OkConfig::default());
        assert_eq!(cfg.limits(), Limits::default());
    }

    #[test]
    fn kebab_case_keys_are_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
"$schema" = "ignored"
post-implementation-check-command = "cargo test"
no-worktree = true

[llm]
engine = "claude"

[plan]
planner-extra-prompt = "Keep steps small."

[implement]
max-implementation-attempts = 4

[implement.completion]
judge-extra-prompt = "Be strict."

[[tasks]]
prompt = "Add a README"
base = "main"
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.post_implementation_check_command, "cargo test");
        assert!(cfg.no_worktree);
        assert_eq!(cfg.llm.engine, Engine::Claude);
        assert!(cfg.llm.allow_unsafe);
        assert_eq!(cfg.plan.planner_extra_prompt, "Keep steps small.");
        assert_eq!(cfg.implement.max_implementation_attempts, 4);
        assert_eq!(cfg.implement.max_consecutive_failures, 3);
        assert_eq!(cfg.implement.completion.judge_extra_prompt, "Be strict.");
        assert_eq!(cfg.tasks.len(), 1);
        assert_eq!(cfg.tasks[0].base.as_deref(), Some("main"));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut cfg = OkConfig::default();
        cfg.implement.max_consecutive_failures = 0;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("max-consecutive-failures"));

        let mut cfg = OkConfig::default();
        cfg.llm_timeout_seconds = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = OkConfig::default();
        cfg.apply(Overrides {
            engine: Some(Engine::Mock),
            model: Some("pro".to_string()),
            base: Some("main".to_string()),
            max_implementation_attempts: Some(2),
            post_implementation_check_command: Some("make test".to_string()),
            prompts: vec!["first".to_string(), "second".to_string()],
            ..Overrides::default()
        })
        .expect("apply");
        assert_eq!(cfg.llm.engine, Engine::Mock);
        assert_eq!(cfg.llm.model.as_deref(), Some("pro"));
        assert_eq!(cfg.base, "main");
        assert_eq!(cfg.limits().max_implementation_attempts, 2);
        assert_eq!(cfg.post_implementation_check_command, "make test");
        let prompts: Vec<&str> = cfg.tasks.iter().map(|t| t.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["first", "second"]);
    }

    #[test]
    fn prompts_conflict_with_file_tasks() {
        let mut cfg = OkConfig::default();
        cfg.tasks.push(TaskConfig::new("from file"));
        let err = cfg
            .apply(Overrides {
                prompts: vec!["from cli".to_string()],
                ..Overrides::default()
            })
            .expect_err("conflict");
        assert!(err.to_string().contains("[[tasks]]"));
    }

    #[test]
    fn task_values_fall_back_to_top_level() {
        let mut cfg = OkConfig::default();
        cfg.cwd = Some(PathBuf::from("repo"));
        cfg.no_worktree = true;
        cfg.tasks.push(TaskConfig::new("a"));
        cfg.tasks.push(TaskConfig {
            prompt: "b".to_string(),
            cwd: Some(PathBuf::from("/elsewhere")),
            base: Some("v1.0".to_string()),
            no_worktree: Some(false),
        });
        let tasks = cfg.resolve_tasks(Path::new("/work"));
        assert_eq!(tasks[0].cwd, PathBuf::from("/work/repo"));
        assert_eq!(tasks[0].base, "HEAD");
        assert!(tasks[0].no_worktree);
        assert_eq!(tasks[1].cwd, PathBuf::from("/elsewhere"));
        assert_eq!(tasks[1].base, "v1.0");
        assert!(!tasks[1].no_worktree);
    }

    #[test]
    fn printed_config_parses_back() {
        let mut cfg = OkConfig::default();
        cfg.tasks.push(TaskConfig::new("a"));
        let text = cfg.to_toml().expect("toml");
        assert!(text.contains("llm-timeout-seconds = 300"));
        let back: OkConfig = toml::from_str(&text).expect("parse");
        assert_eq!(back, cfg);
    }
}
