//! Environment adapter: isolated workspaces, shell commands and commits.
//!
//! The [`Environment`] trait is everything the driver needs from the outside
//! world besides the model. [`GitEnvironment`] implements it with git
//! worktrees and branches; tests use a scripted environment.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::cancel::CancelToken;
use crate::io::config::TaskSpec;
use crate::io::git::{Git, unique_branch_name};
use crate::io::process::{CommandRequest, run_command};

/// Where a task runs. Owned by exactly one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Directory the model and shell commands run in.
    pub root: PathBuf,
    /// Repository the workspace was created from.
    pub repo: PathBuf,
    pub base_commit: String,
    pub branch: String,
    /// True when `root` is a temporary worktree that must be removed.
    pub worktree: bool,
}

/// Result of a shell command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Stdout then stderr, with truncation notices.
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command cancelled")]
    Cancelled,

    #[error("failed to run command: {0}")]
    Spawn(String),
}

pub trait Environment {
    /// Resolve the base revision and create the task's branch (and worktree).
    fn create_isolated_workspace(&self, task: &TaskSpec, number: usize) -> Result<Workspace>;

    /// Run `cmd` with `sh -c` in `cwd`.
    fn run_command(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ShellOutput, CommandError>;

    fn has_uncommitted_changes(&self, workspace: &Workspace) -> Result<bool>;

    /// Everything changed since the base commit, for judges.
    fn diff(&self, workspace: &Workspace) -> Result<String>;

    /// Stage everything and commit. `Ok(false)` when there was nothing to commit.
    fn commit(&self, workspace: &Workspace, message: &str) -> Result<bool>;

    fn head_commit(&self, workspace: &Workspace) -> Result<String>;

    /// Remove a temporary worktree. The branch and its commits stay.
    fn release_workspace(&self, workspace: &Workspace) -> Result<()>;
}

/// Git-backed environment sharing the run's cancellation token.
#[derive(Debug, Clone)]
pub struct GitEnvironment {
    git_timeout: Duration,
    output_limit_bytes: usize,
    cancel: CancelToken,
}

impl GitEnvironment {
    /// `git_timeout` bounds every git call this environment makes.
    pub fn new(git_timeout: Duration, output_limit_bytes: usize, cancel: CancelToken) -> Self {
        Self {
            git_timeout,
            output_limit_bytes,
            cancel,
        }
    }

    /// Git for the task's own work: stops when the run is cancelled.
    fn git(&self, workdir: &Path) -> Git {
        self.cleanup_git(workdir).cancel_on(&self.cancel)
    }

    /// Git for cleanup, which must still run after a cancellation.
    fn cleanup_git(&self, workdir: &Path) -> Git {
        Git::new(workdir).with_limits(self.git_timeout, self.output_limit_bytes)
    }
}

impl Environment for GitEnvironment {
    #[instrument(skip_all, fields(number, base = %task.base, no_worktree = task.no_worktree))]
    fn create_isolated_workspace(&self, task: &TaskSpec, number: usize) -> Result<Workspace> {
        let repo = self.git(&task.cwd);
        let base_commit = repo.resolve_commit(&task.base)?;
        let branch = unique_branch_name(&task.prompt, &repo.local_branches()?);

        if task.no_worktree {
            repo.switch_new_branch(&branch, &base_commit)?;
            info!(branch = %branch, "working in repository directly");
            return Ok(Workspace {
                root: task.cwd.clone(),
                repo: task.cwd.clone(),
                base_commit,
                branch,
                worktree: false,
            });
        }

        let root = tempfile::Builder::new()
            .prefix(&format!("ok_task_{number}_"))
            .tempdir()
            .context("create worktree directory")?
            .keep();
        let setup = repo
            .worktree_add(&root, &base_commit)
            .and_then(|()| self.git(&root).switch_new_branch(&branch, &base_commit));
        if let Err(err) = setup {
            if let Err(cleanup) = self.cleanup_git(&task.cwd).worktree_remove(&root) {
                debug!(err = %cleanup, "worktree cleanup after failed setup");
            }
            if root.exists()
                && let Err(cleanup) = fs::remove_dir_all(&root)
            {
                warn!(
                    err = %cleanup,
                    path = %root.display(),
                    "failed to remove worktree directory"
                );
            }
            return Err(err).context("create task worktree");
        }

        info!(branch = %branch, root = %root.display(), "created task worktree");
        Ok(Workspace {
            root,
            repo: task.cwd.clone(),
            base_commit,
            branch,
            worktree: true,
        })
    }

    #[instrument(skip_all, fields(cwd = %cwd.display(), timeout_secs = timeout.as_secs()))]
    fn run_command(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ShellOutput, CommandError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).current_dir(cwd);
        let request = CommandRequest::new(timeout, self.output_limit_bytes).cancel(&self.cancel);
        let output =
            run_command(command, &request).map_err(|e| CommandError::Spawn(format!("{e:#}")))?;
        if output.cancelled {
            return Err(CommandError::Cancelled);
        }
        if output.timed_out {
            return Err(CommandError::Timeout(timeout));
        }
        debug!(exit_code = ?output.status.code(), "shell command finished");
        Ok(ShellOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: output.combined("command"),
        })
    }

    fn has_uncommitted_changes(&self, workspace: &Workspace) -> Result<bool> {
        self.git(&workspace.root).has_changes()
    }

    fn diff(&self, workspace: &Workspace) -> Result<String> {
        self.git(&workspace.root)
            .diff_against(&workspace.base_commit)
    }

    #[instrument(skip_all, fields(branch = %workspace.branch))]
    fn commit(&self, workspace: &Workspace, message: &str) -> Result<bool> {
        let git = self.git(&workspace.root);
        git.add_all()?;
        git.commit_staged(message)
    }

    fn head_commit(&self, workspace: &Workspace) -> Result<String> {
        self.cleanup_git(&workspace.root).head_sha()
    }

    #[instrument(skip_all, fields(root = %workspace.root.display()))]
    fn release_workspace(&self, workspace: &Workspace) -> Result<()> {
        if !workspace.worktree {
            return Ok(());
        }
        let repo = self.cleanup_git(&workspace.repo);
        if let Err(err) = repo.worktree_remove(&workspace.root) {
            warn!(err = %err, "git worktree remove failed, deleting directory");
            if workspace.root.exists() {
                fs::remove_dir_all(&workspace.root).with_context(|| {
                    format!("remove worktree {}", workspace.root.display())
                })?;
            }
            repo.prune_worktrees()?;
        }
        debug!("released worktree");
        Ok(())
    }
}
