//! Runs a list of tasks one after another.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::types::{RunResult, TaskReport};
use crate::driver::Driver;
use crate::io::config::TaskSpec;
use crate::io::environment::Environment;
use crate::io::history::Session;
use crate::io::model::ModelGateway;

/// Run every task in order and return one report per task that ran.
///
/// A cancelled task stops the loop; the remaining tasks are not started.
/// `on_task` sees each report as soon as its task finishes.
pub fn run_tasks<G, E, F>(
    driver: &Driver<'_, G, E>,
    tasks: &[TaskSpec],
    session: Option<&Session>,
    mut on_task: F,
) -> Result<Vec<TaskReport>>
where
    G: ModelGateway + ?Sized,
    E: Environment + ?Sized,
    F: FnMut(usize, &TaskReport),
{
    let mut reports = Vec::with_capacity(tasks.len());
    for (idx, task) in tasks.iter().enumerate() {
        let number = idx + 1;
        if driver.cancel.is_cancelled() {
            info!(remaining = tasks.len() - idx, "cancelled, skipping remaining tasks");
            break;
        }
        info!(number, total = tasks.len(), "starting task");

        let mut history = session
            .map(|s| s.task(number))
            .transpose()
            .with_context(|| format!("create history for task {number}"))?;
        let report = driver
            .run_task(task, number, history.as_mut())
            .with_context(|| format!("task {number}"))?;
        on_task(number, &report);

        let cancelled = report.result == RunResult::Cancelled;
        reports.push(report);
        if cancelled {
            info!(number, "task cancelled, stopping");
            break;
        }
    }

    if let Some(session) = session
        && let Err(err) = session.write_summary(&reports)
    {
        warn!(err = %format!("{err:#}"), "failed to write session summary");
    }
    Ok(reports)
}
