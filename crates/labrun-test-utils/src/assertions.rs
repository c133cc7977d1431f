//! Assertion helpers for lifecycle tests.

use labrun_flow::experiment::{Experiment, ExperimentStatus};

/// Asserts that an experiment ended in `status` with `done_at` stamped.
///
/// # Panics
///
/// Panics if the status differs or `done_at` is unset.
pub fn assert_terminal(experiment: &Experiment, status: ExperimentStatus) {
    assert!(status.is_terminal(), "{status} is not a terminal status");
    assert_eq!(
        experiment.status, status,
        "expected experiment {} to be {status}, but it was {} (err_msg: {:?})",
        experiment.id, experiment.status, experiment.err_msg
    );
    assert!(
        experiment.done_at > 0,
        "terminal experiment {} has no done_at",
        experiment.id
    );
}

/// Asserts that an experiment failed with an error containing `needle`.
///
/// # Panics
///
/// Panics if the experiment did not fail or the message does not match.
pub fn assert_failed_with(experiment: &Experiment, needle: &str) {
    assert_terminal(experiment, ExperimentStatus::Failed);
    assert!(
        experiment.err_msg.contains(needle),
        "expected err_msg of experiment {} to contain {needle:?}, got {:?}",
        experiment.id,
        experiment.err_msg
    );
}

/// Asserts that an experiment is still in `status`.
///
/// # Panics
///
/// Panics if the status differs.
pub fn assert_status(experiment: &Experiment, status: ExperimentStatus) {
    assert_eq!(
        experiment.status, status,
        "expected experiment {} to be {status}, but it was {}",
        experiment.id, experiment.status
    );
}
