//! `ok`: plan, implement and judge coding tasks with model CLIs.
//!
//! Each task is planned by a planner model until a plan judge approves, then
//! implemented step by step, each attempt reviewed by an implementation judge
//! and a completion judge. Work happens on an `ok/...` branch in its own git
//! worktree.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};
use tracing::{info, warn};

use ok::core::types::TaskReport;
use ok::driver::{Driver, DriverSettings};
use ok::exit_codes;
use ok::io::cancel::{CancelToken, install_interrupt_handler};
use ok::io::config::{CONFIG_FILE_NAME, Engine, Overrides, load_config};
use ok::io::environment::GitEnvironment;
use ok::io::history::Session;
use ok::io::model::{BackendGateway, backend_from_config};
use ok::io::prompt::PromptBuilder;
use ok::logging;
use ok::looping::run_tasks;

const TASK_COLUMN_CHARS: usize = 60;

#[derive(Parser, Debug)]
#[command(
    name = "ok",
    version,
    about = "Plan, implement and judge coding tasks with model CLIs",
    group(ArgGroup::new("engine").multiple(false))
)]
struct Cli {
    /// Task prompts. Each one runs as a separate task, in order.
    prompts: Vec<String>,

    /// Use the claude CLI.
    #[arg(long, group = "engine")]
    claude: bool,
    /// Use the codex CLI.
    #[arg(long, group = "engine")]
    codex: bool,
    /// Use the gemini CLI.
    #[arg(long, group = "engine")]
    gemini: bool,
    /// Use codex through OpenRouter (needs OPENROUTER_API_KEY).
    #[arg(long, group = "engine")]
    openrouter: bool,
    /// Use the opencode CLI.
    #[arg(long, group = "engine")]
    opencode: bool,
    /// Answer from the mock responses file.
    #[arg(long, group = "engine")]
    mock: bool,

    /// Model name passed to the engine.
    #[arg(long)]
    model: Option<String>,
    /// Repository to work in.
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Revision new task branches start from.
    #[arg(long)]
    base: Option<String>,
    /// Work in the repository itself instead of a temporary worktree.
    #[arg(long)]
    no_worktree: bool,

    #[arg(long)]
    max_planning_rounds: Option<u32>,
    #[arg(long)]
    max_implementation_attempts: Option<u32>,
    #[arg(long)]
    max_consecutive_failures: Option<u32>,

    /// Shell command run after every implementation attempt.
    #[arg(long)]
    post_implementation_hook_command: Option<String>,
    /// Shell command that must succeed before an attempt is judged.
    #[arg(long)]
    post_implementation_check_command: Option<String>,

    /// Config file (default: `.ok.toml` in the current directory).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    show_config: bool,
    /// Log progress to stderr.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn engine(&self) -> Option<Engine> {
        [
            (self.claude, Engine::Claude),
            (self.codex, Engine::Codex),
            (self.gemini, Engine::Gemini),
            (self.openrouter, Engine::Openrouter),
            (self.opencode, Engine::Opencode),
            (self.mock, Engine::Mock),
        ]
        .into_iter()
        .find_map(|(set, engine)| set.then_some(engine))
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            engine: self.engine(),
            model: self.model.clone(),
            cwd: self.cwd.clone(),
            base: self.base.clone(),
            no_worktree: self.no_worktree,
            max_planning_rounds: self.max_planning_rounds,
            max_implementation_attempts: self.max_implementation_attempts,
            max_consecutive_failures: self.max_consecutive_failures,
            post_implementation_hook_command: self.post_implementation_hook_command.clone(),
            post_implementation_check_command: self.post_implementation_check_command.clone(),
            prompts: self.prompts.clone(),
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let invocation_dir = std::env::current_dir().context("read current directory")?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| invocation_dir.join(CONFIG_FILE_NAME));
    let mut cfg = load_config(&config_path)?;
    cfg.apply(cli.overrides())?;
    cfg.validate().context("invalid configuration")?;

    if cli.show_config {
        print!("{}", cfg.to_toml()?);
        return Ok(exit_codes::OK);
    }

    let tasks = cfg.resolve_tasks(&invocation_dir);
    if tasks.is_empty() {
        bail!(
            "no tasks: pass task prompts or add [[tasks]] to {}",
            config_path.display()
        );
    }

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone())?;

    let backend = backend_from_config(&cfg)?;
    let gateway = BackendGateway::new(
        backend,
        cfg.llm.allow_unsafe,
        cfg.output_limit_bytes,
        cancel.clone(),
    );
    info!(
        engine = gateway.backend_name(),
        tasks = tasks.len(),
        "starting run"
    );
    let environment =
        GitEnvironment::new(cfg.run_timeout(), cfg.output_limit_bytes, cancel.clone());
    let prompts = PromptBuilder::from_config(&cfg);
    let settings = DriverSettings::from_config(&cfg);
    let session = Session::create(&cfg.state_dir())
        .inspect_err(|err| warn!(err = %format!("{err:#}"), "session history disabled"))
        .ok();

    let driver = Driver {
        gateway: &gateway,
        environment: &environment,
        prompts: &prompts,
        settings: &settings,
        cancel: &cancel,
    };
    let total = tasks.len();
    let reports = run_tasks(&driver, &tasks, session.as_ref(), |number, report| {
        eprintln!("[{number}/{total}] {}: {}", report.result, report.task);
    })?;

    print!("{}", format_summary(&reports));
    if let Some(session) = &session {
        println!("history: {}", session.dir().display());
    }
    if cancel.is_cancelled() {
        return Ok(exit_codes::CANCELLED);
    }
    Ok(exit_codes::for_reports(&reports))
}

/// Plain-text table with one row per task.
fn format_summary(reports: &[TaskReport]) -> String {
    let rows: Vec<[String; 5]> = reports
        .iter()
        .enumerate()
        .map(|(idx, report)| {
            [
                (idx + 1).to_string(),
                report.result.to_string(),
                report.attempt_count().to_string(),
                report.branch.clone().unwrap_or_else(|| "-".to_string()),
                shorten(&report.task, TASK_COLUMN_CHARS),
            ]
        })
        .collect();
    let header = ["#", "RESULT", "ATTEMPTS", "BRANCH", "TASK"].map(str::to_string);

    let mut widths = header.clone().map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for row in std::iter::once(&header).chain(&rows) {
        let mut line = String::new();
        for (idx, (cell, width)) in row.iter().zip(widths).enumerate() {
            if idx + 1 == row.len() {
                line.push_str(cell);
            } else {
                line.push_str(&format!("{cell:<width$}  "));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// First line of `text`, at most `max` chars.
fn shorten(text: &str, max: usize) -> String {
    let first = text.lines().next().unwrap_or("").trim();
    if first.chars().count() <= max {
        return first.to_string();
    }
    let mut cut: String = first.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
