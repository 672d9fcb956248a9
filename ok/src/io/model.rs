//! Model gateway and the CLI backends behind it.
//!
//! The [`ModelGateway`] trait decouples the driver from the actual model
//! provider. Each provider is a [`ModelBackend`] that knows how to build its
//! command line and pull the answer out of the process output. Tests use
//! scripted gateways that return predetermined answers without spawning
//! processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::error::ModelError;
use crate::core::types::Role;
use crate::io::cancel::CancelToken;
use crate::io::config::{Engine, OkConfig};
use crate::io::process::{CommandOutput, CommandRequest, run_command};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_OPENCODE_MODEL: &str = "github-copilot/gpt-4.1";
pub const NO_MOCK_RESPONSE: &str = "No mock response found for this prompt.";
const GEMINI_BANNER: &str = "Loaded cached credentials.";
const OPENCODE_TEXT_MARKER: &str = "Text  ";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// One model call as the driver sees it.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub role: Role,
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Where the call's stdout is streamed while it runs.
    pub transcript_path: Option<PathBuf>,
}

/// Abstraction over model invocation.
///
/// Implementations never retry: budgets and retries belong to the caller.
pub trait ModelGateway {
    fn invoke(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

/// Everything a backend needs for a single call.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub prompt: &'a str,
    pub allow_unsafe: bool,
    pub workdir: &'a Path,
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
    pub output_limit_bytes: usize,
    pub transcript_path: Option<&'a Path>,
}

/// One model provider.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, invocation: &Invocation<'_>) -> Result<String, ModelError>;
}

/// Run a provider CLI and classify its failure modes.
fn run_cli(
    program: &Path,
    args: &[String],
    invocation: &Invocation<'_>,
) -> Result<CommandOutput, ModelError> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(invocation.workdir);
    let request = CommandRequest::new(invocation.timeout, invocation.output_limit_bytes)
        .stream_to(invocation.transcript_path)
        .cancel(invocation.cancel);

    let output = match run_command(cmd, &request) {
        Ok(output) => output,
        Err(err) => {
            let not_found = err
                .downcast_ref::<std::io::Error>()
                .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound);
            if not_found {
                return Err(ModelError::BackendUnavailable(format!(
                    "{} not found",
                    program.display()
                )));
            }
            return Err(ModelError::BackendUnavailable(format!("{err:#}")));
        }
    };

    if output.cancelled {
        return Err(ModelError::Cancelled);
    }
    if output.timed_out {
        return Err(ModelError::Timeout(invocation.timeout));
    }
    if !output.status.success() {
        warn!(
            exit_code = ?output.status.code(),
            stderr = %output.stderr_text().trim(),
            "model process failed"
        );
        return Err(ModelError::ProcessFailure {
            exit_code: output.status.code(),
        });
    }
    Ok(output)
}

/// `claude -p`.
#[derive(Debug, Clone, Default)]
pub struct ClaudeBackend;

impl ClaudeBackend {
    fn args(invocation: &Invocation<'_>) -> Vec<String> {
        let mut args = Vec::new();
        if invocation.allow_unsafe {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push("-p".to_string());
        args.push(invocation.prompt.to_string());
        args
    }
}

impl ModelBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn run(&self, invocation: &Invocation<'_>) -> Result<String, ModelError> {
        let output = run_cli(Path::new("claude"), &Self::args(invocation), invocation)?;
        Ok(output.stdout_text().trim().to_string())
    }
}

/// Custom model provider for codex (`-c model_providers.custom.*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodexProvider {
    pub base_url: String,
    pub env_key: String,
}

/// `codex exec`; the answer is read from `--output-last-message`.
#[derive(Debug, Clone, Default)]
pub struct CodexBackend {
    pub model: Option<String>,
    pub provider: Option<CodexProvider>,
}

impl CodexBackend {
    /// Codex talking to OpenRouter.
    pub fn openrouter(model: Option<String>) -> Self {
        Self {
            model,
            provider: Some(CodexProvider {
                base_url: OPENROUTER_BASE_URL.to_string(),
                env_key: "OPENROUTER_API_KEY".to_string(),
            }),
        }
    }

    fn args(&self, invocation: &Invocation<'_>, output_path: &Path) -> Vec<String> {
        let mut args = Vec::new();
        if invocation.allow_unsafe {
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
        } else {
            args.push("--ask-for-approval=never".to_string());
        }
        if let Some(provider) = &self.provider {
            args.push("-c=model_provider=custom".to_string());
            args.push("-c=model_providers.custom.name=custom".to_string());
            args.push(format!(
                "-c=model_providers.custom.base_url={}",
                provider.base_url
            ));
            args.push(format!(
                "-c=model_providers.custom.env_key={}",
                provider.env_key
            ));
        }
        args.push("exec".to_string());
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(format!("--output-last-message={}", output_path.display()));
        args.push(invocation.prompt.to_string());
        args
    }
}

impl ModelBackend for CodexBackend {
    fn name(&self) -> &'static str {
        if self.provider.is_some() {
            "openrouter"
        } else {
            "codex"
        }
    }

    fn run(&self, invocation: &Invocation<'_>) -> Result<String, ModelError> {
        let output_file = tempfile::Builder::new()
            .prefix("ok-codex-output")
            .tempfile()
            .map_err(|e| ModelError::BackendUnavailable(format!("create codex output file: {e}")))?;
        let args = self.args(invocation, output_file.path());
        run_cli(Path::new("codex"), &args, invocation)?;
        let response = fs::read_to_string(output_file.path()).map_err(|e| {
            ModelError::BackendUnavailable(format!("read codex output file: {e}"))
        })?;
        Ok(response.trim().to_string())
    }
}

/// `gemini -m <model> -p`.
#[derive(Debug, Clone)]
pub struct GeminiBackend {
    pub model: String,
}

impl GeminiBackend {
    pub fn new(model: Option<&str>) -> Self {
        let model = match model {
            None => DEFAULT_GEMINI_MODEL,
            Some("pro") => "gemini-2.5-pro",
            Some("flash") => DEFAULT_GEMINI_MODEL,
            Some(other) => other,
        };
        Self {
            model: model.to_string(),
        }
    }

    fn args(&self, invocation: &Invocation<'_>) -> Vec<String> {
        let mut args = vec!["-m".to_string(), self.model.clone()];
        if invocation.allow_unsafe {
            args.push("--yolo".to_string());
        }
        args.push("-p".to_string());
        args.push(invocation.prompt.to_string());
        args
    }
}

fn strip_gemini_banner(stdout: &str) -> String {
    let trimmed = stdout.trim();
    match trimmed.strip_prefix(GEMINI_BANNER) {
        Some(rest) => rest.trim().to_string(),
        None => trimmed.to_string(),
    }
}

impl ModelBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn run(&self, invocation: &Invocation<'_>) -> Result<String, ModelError> {
        let output = run_cli(Path::new("gemini"), &self.args(invocation), invocation)?;
        Ok(strip_gemini_banner(&output.stdout_text()))
    }
}

/// `opencode run --print`. Prefers a build under `<state-dir>/bin`.
#[derive(Debug, Clone)]
pub struct OpencodeBackend {
    pub program: PathBuf,
    pub model: String,
}

impl OpencodeBackend {
    pub fn new(state_dir: &Path, model: Option<&str>) -> Self {
        let local = state_dir.join("bin").join("opencode");
        let program = if local.exists() {
            local
        } else {
            PathBuf::from("opencode")
        };
        Self {
            program,
            model: model.unwrap_or(DEFAULT_OPENCODE_MODEL).to_string(),
        }
    }
}

fn opencode_text(stdout: &str) -> String {
    let trimmed = stdout.trim();
    match trimmed.split_once(OPENCODE_TEXT_MARKER) {
        Some((_, text)) => text.trim().to_string(),
        None => trimmed.to_string(),
    }
}

impl ModelBackend for OpencodeBackend {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn run(&self, invocation: &Invocation<'_>) -> Result<String, ModelError> {
        let args = vec![
            "run".to_string(),
            "--print".to_string(),
            "--model".to_string(),
            self.model.clone(),
            invocation.prompt.to_string(),
        ];
        let output = run_cli(&self.program, &args, invocation)?;
        Ok(opencode_text(&output.stdout_text()))
    }
}

#[derive(Debug, Deserialize)]
struct MockFile {
    #[serde(default)]
    prompts: Vec<MockEntry>,
}

#[derive(Debug, Deserialize)]
struct MockEntry {
    prompt: String,
    response: String,
}

/// Canned answers keyed by prompt regex, for demos and end-to-end tests.
#[derive(Debug, Clone)]
pub struct MockBackend {
    entries: Vec<(Regex, String)>,
    delay: Duration,
}

impl MockBackend {
    /// Patterns match from the start of the prompt, multi-line and dot-all.
    pub fn from_pairs<I, P, R>(pairs: I, delay: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = (P, R)>,
        P: AsRef<str>,
        R: Into<String>,
    {
        let mut entries = Vec::new();
        for (pattern, response) in pairs {
            let pattern = pattern.as_ref();
            let regex = Regex::new(&format!(r"(?ms)\A(?:{pattern})"))
                .with_context(|| format!("invalid mock prompt regex {pattern:?}"))?;
            entries.push((regex, response.into()));
        }
        Ok(Self { entries, delay })
    }

    pub fn from_file(path: &Path, delay: Duration) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read mock responses {}", path.display()))?;
        let file: MockFile =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        Self::from_pairs(
            file.prompts
                .into_iter()
                .map(|entry| (entry.prompt, entry.response)),
            delay,
        )
    }

    pub fn respond(&self, prompt: &str) -> String {
        self.entries
            .iter()
            .find(|(regex, _)| regex.is_match(prompt))
            .map_or_else(|| NO_MOCK_RESPONSE.to_string(), |(_, response)| response.clone())
    }
}

impl ModelBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn run(&self, invocation: &Invocation<'_>) -> Result<String, ModelError> {
        if !invocation.cancel.sleep(self.delay) {
            return Err(ModelError::Cancelled);
        }
        let response = self.respond(invocation.prompt);
        if let Some(path) = invocation.transcript_path {
            let written = path
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| fs::write(path, &response));
            if let Err(err) = written {
                warn!(err = %err, path = %path.display(), "failed to write mock transcript");
            }
        }
        Ok(response)
    }
}

/// Gateway over a single backend, sharing the run's cancellation token.
pub struct BackendGateway {
    backend: Box<dyn ModelBackend>,
    allow_unsafe: bool,
    output_limit_bytes: usize,
    cancel: CancelToken,
}

impl BackendGateway {
    pub fn new(
        backend: Box<dyn ModelBackend>,
        allow_unsafe: bool,
        output_limit_bytes: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            backend,
            allow_unsafe,
            output_limit_bytes,
            cancel,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

impl ModelGateway for BackendGateway {
    #[instrument(skip_all, fields(role = %request.role, backend = self.backend.name(), timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &ModelRequest) -> Result<String, ModelError> {
        if self.cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        info!(prompt_bytes = request.prompt.len(), "invoking model");
        debug!(prompt = %request.prompt, "model prompt");

        let invocation = Invocation {
            prompt: &request.prompt,
            allow_unsafe: self.allow_unsafe,
            workdir: &request.workdir,
            timeout: request.timeout,
            cancel: &self.cancel,
            output_limit_bytes: self.output_limit_bytes,
            transcript_path: request.transcript_path.as_deref(),
        };
        let result = self.backend.run(&invocation);

        // An answer that arrives after cancellation is discarded.
        if self.cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        match result {
            Ok(response) if response.trim().is_empty() => {
                warn!("model returned an empty response");
                Err(ModelError::EmptyResponse)
            }
            Ok(response) => {
                info!(response_bytes = response.len(), "model answered");
                Ok(response)
            }
            Err(err) => {
                warn!(err = %err, "model call failed");
                Err(err)
            }
        }
    }
}

/// Build the backend selected by `llm.engine`.
pub fn backend_from_config(config: &OkConfig) -> Result<Box<dyn ModelBackend>> {
    let model = config.llm.model.clone();
    let backend: Box<dyn ModelBackend> = match config.llm.engine {
        Engine::Claude => Box::new(ClaudeBackend),
        Engine::Codex => Box::new(CodexBackend {
            model,
            provider: None,
        }),
        Engine::Openrouter => Box::new(CodexBackend::openrouter(model)),
        Engine::Gemini => Box::new(GeminiBackend::new(model.as_deref())),
        Engine::Opencode => Box::new(OpencodeBackend::new(
            &config.state_dir(),
            model.as_deref(),
        )),
        Engine::Mock => Box::new(
            MockBackend::from_file(
                &config.mock_cfg.file,
                Duration::from_secs(config.mock_cfg.delay),
            )
            .context("load mock engine")?,
        ),
    };
    if config.llm.engine == Engine::Claude && config.llm.model.is_some() {
        warn!("llm.model is ignored by the claude engine");
    }
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation<'a>(
        prompt: &'a str,
        cancel: &'a CancelToken,
        allow_unsafe: bool,
    ) -> Invocation<'a> {
        Invocation {
            prompt,
            allow_unsafe,
            workdir: Path::new("."),
            timeout: Duration::from_secs(5),
            cancel,
            output_limit_bytes: 1024,
            transcript_path: None,
        }
    }

    #[test]
    fn claude_args_respect_unsafe_flag() {
        let cancel = CancelToken::new();
        assert_eq!(
            ClaudeBackend::args(&invocation("hi", &cancel, true)),
            vec!["--dangerously-skip-permissions", "-p", "hi"]
        );
        assert_eq!(
            ClaudeBackend::args(&invocation("hi", &cancel, false)),
            vec!["-p", "hi"]
        );
    }

    #[test]
    fn codex_args_for_openrouter() {
        let cancel = CancelToken::new();
        let backend = CodexBackend::openrouter(Some("qwen/qwen3-coder".to_string()));
        let args = backend.args(&invocation("do it", &cancel, false), Path::new("/tmp/out"));
        assert_eq!(args[0], "--ask-for-approval=never");
        let base_url = format!("-c=model_providers.custom.base_url={OPENROUTER_BASE_URL}");
        let env_key = "-c=model_providers.custom.env_key=OPENROUTER_API_KEY".to_string();
        assert!(args.contains(&base_url));
        assert!(args.contains(&env_key));
        let exec = args.iter().position(|a| a == "exec").expect("exec");
        assert_eq!(args[exec + 1..exec + 3], ["--model", "qwen/qwen3-coder"]);
        assert_eq!(args.last().map(String::as_str), Some("do it"));
        assert_eq!(backend.name(), "openrouter");
    }

    #[test]
    fn gemini_model_shortcuts() {
        assert_eq!(GeminiBackend::new(None).model, DEFAULT_GEMINI_MODEL);
        assert_eq!(GeminiBackend::new(Some("pro")).model, "gemini-2.5-pro");
        assert_eq!(GeminiBackend::new(Some("flash")).model, DEFAULT_GEMINI_MODEL);
        assert_eq!(GeminiBackend::new(Some("custom")).model, "custom");
    }

    #[test]
    fn gemini_banner_is_stripped() {
        assert_eq!(
            strip_gemini_banner("Loaded cached credentials.\nAPPROVED\n"),
            "APPROVED"
        );
        assert_eq!(strip_gemini_banner("  plain  "), "plain");
    }

    #[test]
    fn opencode_keeps_text_after_marker() {
        assert_eq!(opencode_text("tool calls...\nText  the answer\n"), "the answer");
        assert_eq!(opencode_text("no marker"), "no marker");
    }

    #[test]
    fn mock_matches_from_prompt_start() {
        let backend = MockBackend::from_pairs(
            [("You are the planner.*", "1. step"), ("judge", "APPROVED")],
            Duration::ZERO,
        )
        .expect("mock");
        assert_eq!(backend.respond("You are the planner.\nTask: x"), "1. step");
        assert_eq!(backend.respond("the judge"), NO_MOCK_RESPONSE);
        assert_eq!(backend.respond("judge this"), "APPROVED");
    }

    #[test]
    fn mock_file_is_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mock.toml");
        fs::write(
            &path,
            "[[prompts]]\nprompt = \".*plan judge.*\"\nresponse = \"APPROVED\"\n",
        )
        .expect("write");
        let backend = MockBackend::from_file(&path, Duration::ZERO).expect("load");
        assert_eq!(backend.respond("you are the plan judge"), "APPROVED");
    }

    #[test]
    fn invalid_mock_regex_is_an_error() {
        let err = MockBackend::from_pairs([("(", "x")], Duration::ZERO).expect_err("invalid");
        assert!(err.to_string().contains("invalid mock prompt regex"));
    }

    #[test]
    fn gateway_turns_blank_answers_into_empty_response() {
        let cancel = CancelToken::new();
        let backend = MockBackend::from_pairs([(".*", "   ")], Duration::ZERO).expect("mock");
        let gateway = BackendGateway::new(Box::new(backend), true, 1024, cancel);
        let request = ModelRequest {
            role: Role::Planner,
            prompt: "plan".to_string(),
            workdir: PathBuf::from("."),
            timeout: Duration::from_secs(1),
            transcript_path: None,
        };
        assert_eq!(gateway.invoke(&request), Err(ModelError::EmptyResponse));
    }

    #[test]
    fn gateway_reports_cancellation() {
        let cancel = CancelToken::new();
        let backend = MockBackend::from_pairs([(".*", "SUCCESS")], Duration::ZERO).expect("mock");
        let gateway = BackendGateway::new(Box::new(backend), true, 1024, cancel.clone());
        cancel.cancel();
        let request = ModelRequest {
            role: Role::ImplementationJudge,
            prompt: "judge".to_string(),
            workdir: PathBuf::from("."),
            timeout: Duration::from_secs(1),
            transcript_path: None,
        };
        assert_eq!(gateway.invoke(&request), Err(ModelError::Cancelled));
    }

    #[test]
    fn missing_cli_is_backend_unavailable() {
        let cancel = CancelToken::new();
        let backend = OpencodeBackend {
            program: PathBuf::from("definitely-not-opencode-ok"),
            model: DEFAULT_OPENCODE_MODEL.to_string(),
        };
        let err = backend
            .run(&invocation("hi", &cancel, true))
            .expect_err("missing binary");
        assert!(matches!(err, ModelError::BackendUnavailable(_)));
    }
}
