//! Kubernetes pod-phase → `RunStatus` mapping.
//!
//! No live Kubernetes client is wired up in this workspace (driving an
//! actual cluster is out of scope); this module exists so the mapping
//! contract is unit-tested and ready for a future `KubernetesRuntime` to
//! reuse behind the same [`crate::ContainerRuntime`] trait.

use v6_types::status::RunStatus;

const IMAGE_PULL_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "InvalidImageName",
    "ErrImageNeverPull",
    "ErrImagePull",
];

const CRASH_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "CreateContainerConfigError",
    "RunContainerError",
    "ContainerCannotRun",
];

const INIT_REASONS: &[&str] = &["ContainerCreating", "PodInitializing"];

/// Maps a terminal pod phase directly to a `RunStatus`. Note this spells
/// "Succeeded" correctly, unlike a `"Succeded"` typo found in one upstream
/// source file that would never match a real Kubernetes phase string (see
/// DESIGN.md).
fn terminal_phase_status(phase: &str) -> Option<RunStatus> {
    match phase {
        "Running" => Some(RunStatus::Active),
        "Failed" => Some(RunStatus::Failed),
        "Succeeded" => Some(RunStatus::Completed),
        "Unknown" => Some(RunStatus::UnknownError),
        _ => None,
    }
}

/// Computes the run status for a job pod given its phase and, if still
/// `Pending`, the waiting-reason reported by its single container.
pub fn compute_job_pod_run_status(phase: &str, pending_reason: Option<&str>) -> RunStatus {
    if phase == "Pending" {
        return match pending_reason {
            Some(reason) if IMAGE_PULL_REASONS.contains(&reason) => RunStatus::NonExistingDockerImage,
            Some(reason) if CRASH_REASONS.contains(&reason) => RunStatus::Crashed,
            Some(reason) if INIT_REASONS.contains(&reason) => RunStatus::Initializing,
            Some(reason) => {
                log::warn!("pod has an unknown/unsupported waiting reason: {reason}");
                RunStatus::UnknownError
            }
            None => RunStatus::Initializing,
        };
    }

    if let Some(status) = terminal_phase_status(phase) {
        return status;
    }

    log::error!("unexpected/unhandled pod phase: {phase}");
    RunStatus::UnknownError
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_pull_reasons_map_to_no_docker_image() {
        for reason in IMAGE_PULL_REASONS {
            assert_eq!(
                compute_job_pod_run_status("Pending", Some(reason)),
                RunStatus::NonExistingDockerImage
            );
        }
    }

    #[test]
    fn crash_reasons_map_to_crashed() {
        for reason in CRASH_REASONS {
            assert_eq!(
                compute_job_pod_run_status("Pending", Some(reason)),
                RunStatus::Crashed
            );
        }
    }

    #[test]
    fn init_reasons_and_absent_reason_map_to_initializing() {
        for reason in INIT_REASONS {
            assert_eq!(
                compute_job_pod_run_status("Pending", Some(reason)),
                RunStatus::Initializing
            );
        }
        assert_eq!(
            compute_job_pod_run_status("Pending", None),
            RunStatus::Initializing
        );
    }

    #[test]
    fn terminal_phases_map_correctly() {
        assert_eq!(compute_job_pod_run_status("Running", None), RunStatus::Active);
        assert_eq!(compute_job_pod_run_status("Failed", None), RunStatus::Failed);
        assert_eq!(
            compute_job_pod_run_status("Succeeded", None),
            RunStatus::Completed
        );
        assert_eq!(
            compute_job_pod_run_status("Unknown", None),
            RunStatus::UnknownError
        );
    }

    #[test]
    fn unexpected_phase_is_unknown_error() {
        assert_eq!(
            compute_job_pod_run_status("Bogus", None),
            RunStatus::UnknownError
        );
    }

    #[test]
    fn unknown_pending_reason_is_unknown_error() {
        assert_eq!(
            compute_job_pod_run_status("Pending", Some("SomeNewReason")),
            RunStatus::UnknownError
        );
    }
}
