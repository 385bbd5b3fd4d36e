use serde::{Deserialize, Serialize};

/// Status of a single organization's `Run` of a `Task`.
///
/// Kept disjoint from `TaskStatus` on purpose: the two enums describe
/// different things (one container execution vs. a whole task's rollup)
/// and sharing a string domain between them has caused confusion in
/// earlier designs this system replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Initializing,
    Active,
    Completed,
    Failed,
    StartFailed,
    NonExistingDockerImage,
    Crashed,
    KilledByUser,
    NotAllowed,
    UnknownError,
    DataframeNotFound,
    DependedOnFailedTask,
    UnexpectedOutput,
}

impl RunStatus {
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            RunStatus::Failed
                | RunStatus::Crashed
                | RunStatus::KilledByUser
                | RunStatus::NotAllowed
                | RunStatus::UnknownError
                | RunStatus::StartFailed
                | RunStatus::NonExistingDockerImage
                | RunStatus::UnexpectedOutput
                | RunStatus::DataframeNotFound
                | RunStatus::DependedOnFailedTask
        )
    }

    pub fn is_finished(self) -> bool {
        self.is_failed() || matches!(self, RunStatus::Completed)
    }

    pub fn is_alive(self) -> bool {
        matches!(
            self,
            RunStatus::Pending | RunStatus::Initializing | RunStatus::Active
        )
    }
}

/// Status of a `Task`, derived from the statuses of its `Run`s. Never stored;
/// always computed on read from the currently loaded runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Initializing,
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Roll up a task's status from its runs' statuses.
    ///
    /// A task with no runs at all is `Pending` (this can happen briefly
    /// between task creation and run materialization).
    pub fn from_run_statuses<I: IntoIterator<Item = RunStatus>>(statuses: I) -> TaskStatus {
        let mut any_failed = false;
        let mut any_active = false;
        let mut any_initializing = false;
        let mut any_pending = false;
        let mut count = 0;

        for status in statuses {
            count += 1;
            if status.is_failed() {
                any_failed = true;
            }
            match status {
                RunStatus::Active => any_active = true,
                RunStatus::Initializing => any_initializing = true,
                RunStatus::Pending => any_pending = true,
                _ => {}
            }
        }

        if count == 0 {
            return TaskStatus::Pending;
        }
        if any_failed {
            TaskStatus::Failed
        } else if any_active {
            TaskStatus::Active
        } else if any_initializing {
            TaskStatus::Initializing
        } else if any_pending {
            TaskStatus::Pending
        } else {
            TaskStatus::Completed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_prefers_failed_over_everything() {
        let statuses = vec![RunStatus::Completed, RunStatus::Failed, RunStatus::Active];
        assert_eq!(TaskStatus::from_run_statuses(statuses), TaskStatus::Failed);
    }

    #[test]
    fn rollup_all_completed_is_completed() {
        let statuses = vec![RunStatus::Completed, RunStatus::Completed];
        assert_eq!(
            TaskStatus::from_run_statuses(statuses),
            TaskStatus::Completed
        );
    }

    #[test]
    fn rollup_no_runs_is_pending() {
        assert_eq!(TaskStatus::from_run_statuses(vec![]), TaskStatus::Pending);
    }

    #[test]
    fn finished_implies_not_alive() {
        for status in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Crashed,
            RunStatus::KilledByUser,
        ] {
            assert!(status.is_finished());
            assert!(!status.is_alive());
        }
    }
}
