//! Session history under `<state-dir>/sessions/`.
//!
//! One directory per `ok` invocation, one `task-<n>/` per task. Model calls
//! stream into `calls/<seq>-<role>.log`; the approved plan and the final
//! report are written when the task finishes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Role, TaskReport};

/// Directory of one `ok` invocation.
#[derive(Debug, Clone)]
pub struct Session {
    dir: PathBuf,
}

impl Session {
    /// Create `<state_dir>/sessions/<timestamp>_<pid>/`.
    pub fn create(state_dir: &Path) -> Result<Self> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let dir = state_dir
            .join("sessions")
            .join(format!("{stamp}_{}", std::process::id()));
        fs::create_dir_all(&dir)
            .with_context(|| format!("create session dir {}", dir.display()))?;
        debug!(dir = %dir.display(), "session history created");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// History for the `number`-th task (one-based).
    pub fn task(&self, number: usize) -> Result<TaskHistory> {
        TaskHistory::create(self.dir.join(format!("task-{number}")))
    }

    /// Reports of every task that ran, in order.
    pub fn write_summary(&self, reports: &[TaskReport]) -> Result<()> {
        write_json(&self.dir.join("summary.json"), &reports)
    }
}

#[derive(Debug, Clone)]
pub struct HistoryPaths {
    pub dir: PathBuf,
    pub plan_path: PathBuf,
    pub report_path: PathBuf,
    pub calls_dir: PathBuf,
}

impl HistoryPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            plan_path: dir.join("plan.md"),
            report_path: dir.join("report.json"),
            calls_dir: dir.join("calls"),
            dir,
        }
    }
}

/// Files of a single task.
#[derive(Debug)]
pub struct TaskHistory {
    paths: HistoryPaths,
    next_call: u32,
}

impl TaskHistory {
    pub fn create(dir: PathBuf) -> Result<Self> {
        let paths = HistoryPaths::new(dir);
        fs::create_dir_all(&paths.calls_dir)
            .with_context(|| format!("create task history {}", paths.dir.display()))?;
        Ok(Self {
            paths,
            next_call: 1,
        })
    }

    pub fn paths(&self) -> &HistoryPaths {
        &self.paths
    }

    /// Path for the next model call's transcript, e.g. `calls/003-plan-judge.log`.
    pub fn next_transcript(&mut self, role: Role) -> PathBuf {
        let path = self
            .paths
            .calls_dir
            .join(format!("{:03}-{}.log", self.next_call, role.as_str()));
        self.next_call += 1;
        path
    }

    /// Write `plan.md` (when a plan was approved) and `report.json`.
    pub fn write_report(&self, report: &TaskReport) -> Result<()> {
        if let Some(plan) = &report.plan {
            let mut text = plan.text.trim_end().to_string();
            text.push('\n');
            write_text(&self.paths.plan_path, &text)?;
        }
        write_json(&self.paths.report_path, report)?;
        debug!(
            path = %self.paths.report_path.display(),
            result = %report.result,
            "task report written"
        );
        Ok(())
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
