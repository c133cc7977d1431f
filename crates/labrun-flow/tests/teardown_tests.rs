//! Teardown retries, escalation to operators and idempotent cleanup.

#![allow(clippy::expect_used)]

use labrun_flow::dispatch::TaskKind;
use labrun_flow::error::Result;
use labrun_flow::experiment::ExperimentStatus;
use labrun_flow::lab::{JobState, LabError};
use labrun_flow::orchestrator::Disposition;
use labrun_flow::tasks::TeardownRequest;
use labrun_test_utils::{
    ExperimentFactory, RecordingNotifier, TEST_LAB_ADDRESS, TestHarness, assert_failed_with,
    failed_env, test_config,
};

fn remote_error() -> LabError {
    LabError::remote("InternalError", "backend unavailable")
}

#[tokio::test]
async fn exhausted_teardown_escalates_to_three_notification_attempts() -> Result<()> {
    let harness = TestHarness::build(test_config(), RecordingNotifier::failing());
    harness.insert(ExperimentFactory::computing(1, "env-1", "job-1"));
    harness.lab.set_job_state(JobState::Failed);
    for _ in 0..7 {
        harness.lab.on_delete_env(Err(remote_error()));
    }
    harness.schedule(TaskKind::ComputeMonitor, 1).await;

    let first = harness.run_next().await.expect("task")?;
    assert_eq!(first, Disposition::Finalized(ExperimentStatus::Failed));
    assert_failed_with(&harness.experiment(1).await, "job failed");

    let pending = harness.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind(), Some(TaskKind::Teardown));
    assert_eq!(pending[0].retry_count, 1);

    let mut teardown_runs = Vec::new();
    let mut notify_runs = Vec::new();
    while let Some(entry) = harness.queue.take()? {
        let kind = entry.envelope.kind().expect("known task");
        let retry_count = entry.envelope.retry_count;
        let disposition = harness.orchestrator.execute(entry.envelope).await?;
        match kind {
            TaskKind::Teardown => teardown_runs.push((retry_count, disposition)),
            TaskKind::NotifyTeardownFailed => notify_runs.push((retry_count, disposition)),
            other => panic!("unexpected {other:?}"),
        }
    }

    // One inline attempt plus six rescheduled ones.
    assert_eq!(harness.lab.delete_env_count(), 7);
    assert_eq!(
        teardown_runs,
        vec![
            (1, Disposition::Retried),
            (2, Disposition::Retried),
            (3, Disposition::Retried),
            (4, Disposition::Retried),
            (5, Disposition::Retried),
            (6, Disposition::Escalated),
        ]
    );
    assert_eq!(
        notify_runs,
        vec![(1, Disposition::Retried), (2, Disposition::Completed)]
    );

    assert_eq!(harness.notifier.attempts(), 3);
    for notice in harness.notifier.notices() {
        assert_eq!(notice.experiment_id, 1);
        assert_eq!(notice.env_id.as_deref(), Some("env-1"));
        assert_eq!(notice.job_id.as_deref(), Some("job-1"));
        assert_eq!(notice.lab_address, TEST_LAB_ADDRESS);
    }

    assert_failed_with(&harness.experiment(1).await, "job failed");
    Ok(())
}

#[tokio::test]
async fn delivered_notification_stops_after_first_attempt() -> Result<()> {
    let mut config = test_config();
    config.teardown_max_retries = 0;
    let harness = TestHarness::build(config, RecordingNotifier::new());
    harness.insert(ExperimentFactory::creating_env(2, "env-2"));
    harness.lab.on_query_env(Ok(failed_env(0, 2)));
    harness.lab.on_delete_env(Err(remote_error()));
    harness.schedule(TaskKind::EnvMonitor, 2).await;

    harness.run_next().await.expect("task")?;

    assert_eq!(harness.notifier.attempts(), 1);
    assert!(harness.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn teardown_recovers_on_a_later_attempt() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::creating_env(3, "env-3"));
    harness.lab.on_query_env(Ok(failed_env(1, 1)));
    harness
        .lab
        .on_delete_env(Err(LabError::Timeout))
        .on_delete_env(Err(remote_error()));
    harness.schedule(TaskKind::EnvMonitor, 3).await;

    let results = harness.run_until_idle(10).await;
    let dispositions: Vec<_> = results.into_iter().collect::<Result<_>>()?;
    assert_eq!(
        dispositions,
        vec![
            Disposition::Finalized(ExperimentStatus::Failed),
            Disposition::Retried,
            Disposition::Completed,
        ]
    );
    assert_eq!(harness.lab.delete_env_count(), 3);
    assert_eq!(harness.notifier.attempts(), 0);
    Ok(())
}

#[tokio::test]
async fn not_found_resources_count_as_deleted() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::computing(4, "env-4", "job-4"));
    harness
        .lab
        .on_query_job(Err(LabError::not_found("job", "job-4")))
        .on_delete_env(Err(LabError::not_found("environment", "env-4")));
    harness.schedule(TaskKind::ComputeMonitor, 4).await;

    let disposition = harness.run_next().await.expect("task")?;
    assert_eq!(
        disposition,
        Disposition::Finalized(ExperimentStatus::Failed)
    );
    assert_failed_with(&harness.experiment(4).await, "job job-4 no longer exists");

    // The vanished job is neither terminated nor deleted again.
    assert_eq!(harness.lab.terminate_count(), 0);
    assert_eq!(harness.lab.delete_job_count(), 0);
    assert_eq!(harness.lab.delete_env_count(), 1);
    assert!(harness.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn repeated_teardown_of_deleted_resources_is_a_no_op() -> Result<()> {
    let harness = TestHarness::new();
    let request = TeardownRequest {
        lab_address: TEST_LAB_ADDRESS.to_string(),
        env_id: Some("env-5".to_string()),
        job_id: Some("job-5".to_string()),
    };
    let services = harness.orchestrator.services();

    for _ in 0..2 {
        harness
            .lab
            .on_query_job(Err(LabError::not_found("job", "job-5")))
            .on_delete_env(Err(LabError::not_found("environment", "env-5")));
        let envelope = services.cleanup_envelope(TaskKind::Teardown, 5, &request);
        let disposition = harness.orchestrator.execute(envelope).await?;
        assert_eq!(disposition, Disposition::Completed);
    }

    assert_eq!(harness.lab.delete_job_count(), 0);
    assert_eq!(harness.lab.delete_env_count(), 2);
    assert!(harness.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn running_job_is_terminated_before_deletion() -> Result<()> {
    let harness = TestHarness::new();
    let request = TeardownRequest {
        lab_address: TEST_LAB_ADDRESS.to_string(),
        env_id: None,
        job_id: Some("job-6".to_string()),
    };
    harness.lab.on_query_job(Ok(JobState::Running));

    let envelope = harness
        .orchestrator
        .services()
        .cleanup_envelope(TaskKind::Teardown, 6, &request);
    harness.orchestrator.execute(envelope).await?;

    assert_eq!(harness.lab.terminate_count(), 1);
    assert_eq!(harness.lab.delete_job_count(), 1);
    assert_eq!(harness.lab.delete_env_count(), 0);
    Ok(())
}
