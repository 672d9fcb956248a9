//! Git adapter for task workspaces.
//!
//! Every task gets its own branch, and by default its own worktree, so we keep
//! a small, explicit wrapper around `git` subprocess calls. Calls run through
//! [`run_command`], so they are bounded by a timeout and can be cancelled like
//! any other child process.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::io::cancel::CancelToken;
use crate::io::process::{CommandOutput, CommandRequest, run_command};

pub const BRANCH_PREFIX: &str = "ok/";
const MAX_BRANCH_NAME_LEN: usize = 100;
const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

static INVALID_BRANCH_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-z0-9/]+").expect("branch name regex should be valid")
});

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<CancelToken>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            cancel: None,
        }
    }

    pub fn with_limits(mut self, timeout: Duration, output_limit_bytes: usize) -> Self {
        self.timeout = timeout;
        self.output_limit_bytes = output_limit_bytes;
        self
    }

    /// Kill any running git call once `token` fires.
    pub fn cancel_on(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolve a branch, tag, SHA or relative specifier to a full commit SHA.
    #[instrument(skip_all, fields(rev))]
    pub fn resolve_commit(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self
            .run_capture(&["rev-parse", "--verify", "--quiet", &spec])
            .with_context(|| format!("resolve base revision '{rev}'"))?;
        let sha = out.trim().to_string();
        if sha.is_empty() {
            return Err(anyhow!("base revision '{rev}' did not resolve to a commit"));
        }
        debug!(sha = %sha, "resolved revision");
        Ok(sha)
    }

    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn local_branches(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&[
            "for-each-ref",
            "--format=%(refname:short)",
            "refs/heads/",
        ])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Create and switch to `branch` starting at `start`.
    #[instrument(skip_all, fields(branch))]
    pub fn switch_new_branch(&self, branch: &str, start: &str) -> Result<()> {
        debug!(branch, start, "creating and switching to new branch");
        self.run_checked(&["switch", "-c", branch, start])?;
        Ok(())
    }

    /// Add a detached worktree at `path` checked out at `commit`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_add(&self, path: &Path, commit: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--detach", &path_arg, commit])?;
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path_arg])?;
        Ok(())
    }

    pub fn prune_worktrees(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Diff of the working tree against `base`, committed and uncommitted alike.
    ///
    /// Untracked files are not part of `git diff`; they are listed after it.
    pub fn diff_against(&self, base: &str) -> Result<String> {
        let mut diff = self.run_capture(&["diff", base])?;
        let untracked: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(StatusEntry::is_untracked)
            .collect();
        if !untracked.is_empty() {
            if !diff.is_empty() && !diff.ends_with('\n') {
                diff.push('\n');
            }
            diff.push_str("Untracked files:\n");
            for entry in untracked {
                diff.push_str(&format!("  {}\n", entry.path));
            }
        }
        Ok(diff)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!out.stdout_text().trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--no-verify", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.status.success() {
            warn!(args = %args.join(" "), "git command failed");
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let mut request = CommandRequest::new(self.timeout, self.output_limit_bytes);
        if let Some(token) = &self.cancel {
            request = request.cancel(token);
        }
        let output = run_command(cmd, &request)
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if output.cancelled {
            bail!("git {} cancelled", args.join(" "));
        }
        if output.timed_out {
            bail!("git {} timed out after {:?}", args.join(" "), self.timeout);
        }
        Ok(output)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Turn free text into a valid branch name.
///
/// `/` survives as a separator, but never leading, trailing or doubled, and
/// no path component starts or ends with `-`.
pub fn sanitize_branch_name(name: &str) -> String {
    if name.trim().is_empty() {
        return "no-name".to_string();
    }
    let lower = name.to_lowercase();
    let replaced = INVALID_BRANCH_CHARS.replace_all(&lower, "-");
    let joined = replaced
        .split('/')
        .map(|component| component.trim_matches('-'))
        .filter(|component| !component.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    let truncated: String = joined.chars().take(MAX_BRANCH_NAME_LEN).collect();
    let cleaned = truncated.trim_end_matches(['-', '/']).to_string();
    if cleaned.is_empty() {
        "no-name".to_string()
    } else {
        cleaned
    }
}

/// `ok/<sanitized task>`, suffixed `-1`, `-2`, ... until it is not in `existing`.
pub fn unique_branch_name(task: &str, existing: &[String]) -> String {
    let base = format!("{BRANCH_PREFIX}{}", sanitize_branch_name(task));
    if !existing.iter().any(|b| b == &base) {
        return base;
    }
    let mut counter = 1u32;
    loop {
        let candidate = format!("{base}-{counter}");
        if !existing.iter().any(|b| b == &candidate) {
            return candidate;
        }
        counter += 1;
    }
}
