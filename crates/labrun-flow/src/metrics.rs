//! Observability metrics for the orchestrator.
//!
//! Metrics go through the `metrics` crate facade; install any recorder
//! (Prometheus, statsd) in the binary to export them.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `labrun_task_executions_total` | Counter | `task`, `outcome` | Reconciliation steps by result |
//! | `labrun_task_duration_seconds` | Histogram | `task`, `outcome` | Step duration |
//! | `labrun_status_transitions_total` | Counter | `from_status`, `to_status` | Experiment status changes |
//! | `labrun_teardown_attempts_total` | Counter | `result` | Teardown attempts |
//! | `labrun_notifications_total` | Counter | `result` | Operator notification attempts |
//! | `labrun_submissions_total` | Counter | `result` | Submission outcomes |
//! | `labrun_queue_depth` | Gauge | `queue` | Pending tasks |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Reconciliation steps by task and outcome.
    pub const TASK_EXECUTIONS_TOTAL: &str = "labrun_task_executions_total";
    /// Histogram: Step duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "labrun_task_duration_seconds";
    /// Counter: Experiment status transitions.
    pub const STATUS_TRANSITIONS_TOTAL: &str = "labrun_status_transitions_total";
    /// Counter: Teardown attempts by result.
    pub const TEARDOWN_ATTEMPTS_TOTAL: &str = "labrun_teardown_attempts_total";
    /// Counter: Operator notification attempts by result.
    pub const NOTIFICATIONS_TOTAL: &str = "labrun_notifications_total";
    /// Counter: Submissions by result.
    pub const SUBMISSIONS_TOTAL: &str = "labrun_submissions_total";
    /// Gauge: Pending tasks in the queue.
    pub const QUEUE_DEPTH: &str = "labrun_queue_depth";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task kind label.
    pub const TASK: &str = "task";
    /// Step outcome (reschedule, advance, terminal, skip, error).
    pub const OUTCOME: &str = "outcome";
    /// Previous status.
    pub const FROM_STATUS: &str = "from_status";
    /// New status.
    pub const TO_STATUS: &str = "to_status";
    /// Result (success, failure, retry, exhausted).
    pub const RESULT: &str = "result";
    /// Queue name.
    pub const QUEUE: &str = "queue";
}

/// High-level interface for recording orchestrator metrics.
///
/// Cheap to clone and share across workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records one executed step and its duration.
    pub fn record_task_execution(&self, task: &str, outcome: &str, duration: Duration) {
        counter!(
            names::TASK_EXECUTIONS_TOTAL,
            labels::TASK => task.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        histogram!(
            names::TASK_DURATION_SECONDS,
            labels::TASK => task.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records an experiment status transition.
    pub fn record_status_transition(&self, from_status: &str, to_status: &str) {
        counter!(
            names::STATUS_TRANSITIONS_TOTAL,
            labels::FROM_STATUS => from_status.to_string(),
            labels::TO_STATUS => to_status.to_string(),
        )
        .increment(1);
    }

    /// Records a teardown attempt.
    pub fn record_teardown(&self, result: &str) {
        counter!(names::TEARDOWN_ATTEMPTS_TOTAL, labels::RESULT => result.to_string())
            .increment(1);
    }

    /// Records a notification attempt.
    pub fn record_notification(&self, delivered: bool) {
        let result = if delivered { "success" } else { "failure" };
        counter!(names::NOTIFICATIONS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records a submission outcome.
    pub fn record_submission(&self, result: &str) {
        counter!(names::SUBMISSIONS_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Sets the queue depth.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(names::QUEUE_DEPTH, labels::QUEUE => queue.to_string()).set(depth as f64);
    }
}

/// Measures a step from creation until [`StepTimer::finish`].
#[derive(Debug)]
pub struct StepTimer {
    start: Instant,
    task: &'static str,
}

impl StepTimer {
    /// Starts timing a step of the given task kind.
    #[must_use]
    pub fn start(task: &'static str) -> Self {
        Self {
            start: Instant::now(),
            task,
        }
    }

    /// Returns the elapsed time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Records the step with its outcome.
    pub fn finish(self, metrics: &FlowMetrics, outcome: &str) {
        metrics.record_task_execution(self.task, outcome, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        let metrics = FlowMetrics::new();
        metrics.record_task_execution("env_monitor", "reschedule", Duration::from_millis(3));
        metrics.record_status_transition("creating_env", "computing");
        metrics.record_teardown("retry");
        metrics.record_notification(false);
        metrics.record_submission("success");
        metrics.set_queue_depth("labrun_tasks", 4);
    }

    #[test]
    fn step_timer_measures_elapsed() {
        let timer = StepTimer::start("teardown");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
        timer.finish(&FlowMetrics::new(), "terminal");
    }
}
