//! Scripted collaborators and repository fixtures for tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::error::ModelError;
use crate::core::types::Role;
use crate::io::cancel::CancelToken;
use crate::io::config::TaskSpec;
use crate::io::environment::{CommandError, Environment, ShellOutput, Workspace};
use crate::io::model::{ModelGateway, ModelRequest};

pub const SCRIPTED_BASE: &str = "base-sha";
pub const SCRIPTED_HEAD: &str = "head-sha";
pub const SCRIPTED_DIFF: &str = "diff --git a/notes.txt b/notes.txt\n+hello\n";

/// One scripted model answer.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(ModelError),
    /// Fire the cancellation token during the call, then answer anyway.
    CancelDuring(String),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

/// A model call as the gateway saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub role: Role,
    pub prompt: String,
    pub workdir: PathBuf,
    pub transcript_path: Option<PathBuf>,
}

/// Gateway answering from per-role queues and recording every call.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    replies: Mutex<HashMap<Role, VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    cancel: Option<CancelToken>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token fired by [`ScriptedReply::CancelDuring`].
    pub fn with_cancel(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    /// Queue replies for `role`, consumed in order.
    pub fn on<I>(self, role: Role, replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        {
            let mut map = self.replies.lock().expect("replies lock");
            map.entry(role).or_default().extend(replies);
        }
        self
    }

    /// Queue plain-text replies for `role`.
    pub fn texts<I, S>(self, role: Role, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.on(role, texts.into_iter().map(ScriptedReply::text))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn roles(&self) -> Vec<Role> {
        self.calls().into_iter().map(|call| call.role).collect()
    }

    pub fn count(&self, role: Role) -> usize {
        self.calls().iter().filter(|call| call.role == role).count()
    }

    /// Replies that were scripted but never asked for.
    pub fn unused(&self) -> usize {
        self.replies
            .lock()
            .expect("replies lock")
            .values()
            .map(VecDeque::len)
            .sum()
    }
}

impl ModelGateway for ScriptedGateway {
    fn invoke(&self, request: &ModelRequest) -> Result<String, ModelError> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            role: request.role,
            prompt: request.prompt.clone(),
            workdir: request.workdir.clone(),
            transcript_path: request.transcript_path.clone(),
        });
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .get_mut(&request.role)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Fail(err)) => Err(err),
            Some(ScriptedReply::CancelDuring(text)) => {
                if let Some(token) = &self.cancel {
                    token.cancel();
                }
                Ok(text)
            }
            None => Err(ModelError::BackendUnavailable(format!(
                "no scripted reply for {}",
                request.role
            ))),
        }
    }
}

/// In-memory environment with scripted shell results.
#[derive(Debug)]
pub struct ScriptedEnvironment {
    root: PathBuf,
    setup_error: Option<String>,
    commit_error: Option<String>,
    has_changes: bool,
    shell: Mutex<VecDeque<Result<ShellOutput, CommandError>>>,
    commands: Mutex<Vec<String>>,
    commits: Mutex<Vec<String>>,
    created: Mutex<usize>,
    released: Mutex<usize>,
}

impl Default for ScriptedEnvironment {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/scripted/workspace"),
            setup_error: None,
            commit_error: None,
            has_changes: true,
            shell: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            created: Mutex::new(0),
            released: Mutex::new(0),
        }
    }
}

impl ScriptedEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_setup(mut self, reason: impl Into<String>) -> Self {
        self.setup_error = Some(reason.into());
        self
    }

    pub fn failing_commits(mut self, reason: impl Into<String>) -> Self {
        self.commit_error = Some(reason.into());
        self
    }

    /// What `has_uncommitted_changes` reports (default `true`).
    pub fn with_changes(mut self, has_changes: bool) -> Self {
        self.has_changes = has_changes;
        self
    }

    /// Queue shell command results; unscripted commands succeed silently.
    pub fn shell_results<I>(self, results: I) -> Self
    where
        I: IntoIterator<Item = Result<ShellOutput, CommandError>>,
    {
        self.shell.lock().expect("shell lock").extend(results);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().expect("commits lock").clone()
    }

    pub fn created(&self) -> usize {
        *self.created.lock().expect("created lock")
    }

    pub fn released(&self) -> usize {
        *self.released.lock().expect("released lock")
    }
}

/// Shell output for a command that exited with `code`.
pub fn shell(code: i32, output: &str) -> Result<ShellOutput, CommandError> {
    Ok(ShellOutput {
        success: code == 0,
        exit_code: Some(code),
        output: output.to_string(),
    })
}

impl Environment for ScriptedEnvironment {
    fn create_isolated_workspace(&self, task: &TaskSpec, number: usize) -> Result<Workspace> {
        if let Some(reason) = &self.setup_error {
            return Err(anyhow!("{reason}"));
        }
        *self.created.lock().expect("created lock") += 1;
        Ok(Workspace {
            root: self.root.clone(),
            repo: task.cwd.clone(),
            base_commit: SCRIPTED_BASE.to_string(),
            branch: format!("ok/task-{number}"),
            worktree: true,
        })
    }

    fn run_command(
        &self,
        cmd: &str,
        _cwd: &Path,
        _timeout: Duration,
    ) -> Result<ShellOutput, CommandError> {
        self.commands
            .lock()
            .expect("commands lock")
            .push(cmd.to_string());
        self.shell
            .lock()
            .expect("shell lock")
            .pop_front()
            .unwrap_or_else(|| shell(0, ""))
    }

    fn has_uncommitted_changes(&self, _workspace: &Workspace) -> Result<bool> {
        Ok(self.has_changes)
    }

    fn diff(&self, _workspace: &Workspace) -> Result<String> {
        Ok(if self.has_changes {
            SCRIPTED_DIFF.to_string()
        } else {
            String::new()
        })
    }

    fn commit(&self, _workspace: &Workspace, message: &str) -> Result<bool> {
        if let Some(reason) = &self.commit_error {
            return Err(anyhow!("{reason}"));
        }
        self.commits
            .lock()
            .expect("commits lock")
            .push(message.to_string());
        Ok(self.has_changes)
    }

    fn head_commit(&self, _workspace: &Workspace) -> Result<String> {
        let committed = !self.commits.lock().expect("commits lock").is_empty();
        Ok(if committed && self.has_changes {
            SCRIPTED_HEAD.to_string()
        } else {
            SCRIPTED_BASE.to_string()
        })
    }

    fn release_workspace(&self, _workspace: &Workspace) -> Result<()> {
        *self.released.lock().expect("released lock") += 1;
        Ok(())
    }
}

/// A task on `cwd` with default base and worktree settings.
pub fn task(prompt: &str, cwd: &Path) -> TaskSpec {
    TaskSpec {
        prompt: prompt.to_string(),
        cwd: cwd.to_path_buf(),
        base: "HEAD".to_string(),
        no_worktree: false,
    }
}

/// `git init` with an identity and one commit holding `README.md`.
pub fn init_git_repo(root: &Path) {
    let git = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {} failed", args.join(" "));
    };
    git(&["init", "-q"]);
    git(&["config", "user.email", "ok@example.com"]);
    git(&["config", "user.name", "ok tests"]);
    git(&["config", "commit.gpgsign", "false"]);
    std::fs::write(root.join("README.md"), "# fixture\n").expect("write readme");
    git(&["add", "-A"]);
    git(&["commit", "-q", "-m", "initial"]);
}
