//! Stable exit codes for the `ok` CLI.

use crate::core::types::{RunResult, TaskReport};

/// Every task completed.
pub const OK: i32 = 0;
/// At least one task was abandoned after spending its budget.
pub const ABANDONED: i32 = 1;
/// Invalid configuration, or a task could not be set up.
pub const INVALID: i32 = 2;
/// The run was interrupted.
pub const CANCELLED: i32 = 130;

/// Exit code for a finished run. The most severe outcome wins.
pub fn for_reports(reports: &[TaskReport]) -> i32 {
    let mut code = OK;
    for report in reports {
        let task_code = match report.result {
            RunResult::Completed => OK,
            RunResult::AbandonedAfterMaxAttempts | RunResult::AbandonedAfterConsecutiveFailures => {
                ABANDONED
            }
            RunResult::ConfigurationError => INVALID,
            RunResult::Cancelled => return CANCELLED,
        };
        code = code.max(task_code);
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(result: RunResult) -> TaskReport {
        TaskReport {
            task: "t".to_string(),
            result,
            detail: None,
            base_commit: None,
            branch: None,
            last_commit: None,
            planning: Vec::new(),
            plan: None,
        }
    }

    #[test]
    fn empty_run_is_ok() {
        assert_eq!(for_reports(&[]), OK);
    }

    #[test]
    fn most_severe_outcome_wins() {
        let reports = vec![
            report(RunResult::Completed),
            report(RunResult::AbandonedAfterMaxAttempts),
        ];
        assert_eq!(for_reports(&reports), ABANDONED);

        let reports = vec![
            report(RunResult::ConfigurationError),
            report(RunResult::AbandonedAfterConsecutiveFailures),
        ];
        assert_eq!(for_reports(&reports), INVALID);
    }

    #[test]
    fn cancellation_overrides_everything() {
        let reports = vec![
            report(RunResult::ConfigurationError),
            report(RunResult::Cancelled),
        ];
        assert_eq!(for_reports(&reports), CANCELLED);
    }
}
