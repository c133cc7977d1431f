//! Dispatcher behavior under redelivery, lock contention, a full queue, panics
//! and the worker pool.

#![allow(clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use labrun_flow::dispatch::memory::InMemoryTaskQueue;
use labrun_flow::dispatch::{TaskEnvelope, TaskKind};
use labrun_flow::error::{Error, Result};
use labrun_flow::experiment::ExperimentStatus;
use labrun_flow::lab::LabError;
use labrun_flow::orchestrator::{Disposition, Orchestrator};
use labrun_flow::store::ExperimentStore;
use labrun_flow::tasks::{StepContext, StepOutcome, TaskHandler, TeardownRequest};
use labrun_flow::worker::{WorkerPool, execute_contained};
use labrun_test_utils::{
    ExperimentFactory, RecordingNotifier, StaticConnector, TEST_LAB_ADDRESS, TestHarness,
    assert_failed_with, assert_status, assert_terminal, failed_env, running_env, test_config,
};

#[tokio::test]
async fn transient_error_redelivers_without_touching_status() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::creating_env(1, "env-1"));
    harness
        .lab
        .on_query_env(Err(LabError::Timeout))
        .on_query_env(Ok(running_env(4)));
    harness.schedule(TaskKind::EnvMonitor, 1).await;

    let first = harness.run_next().await.expect("task")?;
    assert_eq!(first, Disposition::Redelivered);
    assert_status(&harness.experiment(1).await, ExperimentStatus::CreatingEnv);
    assert!(harness.store.history(1)?.is_empty());

    let pending = harness.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind(), Some(TaskKind::EnvMonitor));
    assert_eq!(pending[0].retry_count, 0);

    let second = harness.run_next().await.expect("task")?;
    assert_eq!(second, Disposition::Advanced(TaskKind::ComputeMonitor));
    assert_eq!(harness.lab.submit_count(), 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_delivery_never_submits_twice() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::creating_env(2, "env-2"));
    harness.lab.set_env_status(running_env(4));

    let envelope = harness
        .orchestrator
        .services()
        .envelope(TaskKind::EnvMonitor, 2);
    let first = harness.orchestrator.execute(envelope.clone()).await?;
    let second = harness.orchestrator.execute(envelope).await?;

    assert_eq!(first, Disposition::Advanced(TaskKind::ComputeMonitor));
    assert_eq!(second, Disposition::Skipped);
    assert_eq!(harness.lab.submit_count(), 1);
    assert_status(&harness.experiment(2).await, ExperimentStatus::Computing);
    Ok(())
}

#[tokio::test]
async fn stale_delivery_after_terminal_status_is_discarded() -> Result<()> {
    let harness = TestHarness::new();
    let mut experiment = ExperimentFactory::computing(3, "env-3", "job-3");
    experiment.status = ExperimentStatus::Succeeded;
    experiment.done_at = 1_700_000_100;
    harness.insert(experiment);

    harness.schedule(TaskKind::ComputeMonitor, 3).await;
    harness.schedule(TaskKind::EnvMonitor, 3).await;
    let results = harness.run_until_idle(5).await;

    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result?, Disposition::Skipped);
    }
    assert!(harness.lab.calls().is_empty());
    assert!(harness.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn locked_row_redelivers_the_delivery() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::creating_env(4, "env-4"));
    harness.lab.set_env_status(running_env(4));
    let held = harness.store.lock(4).await?.into_row().expect("row");

    harness.schedule(TaskKind::EnvMonitor, 4).await;
    let disposition = harness.run_next().await.expect("task")?;

    assert_eq!(disposition, Disposition::Redelivered);
    assert!(harness.lab.calls().is_empty());
    assert_eq!(harness.pending_kinds(), vec![TaskKind::EnvMonitor]);
    harness.assert_not_orphaned(4).await;

    drop(held);
    let disposition = harness.run_next().await.expect("task")?;
    assert_eq!(disposition, Disposition::Advanced(TaskKind::ComputeMonitor));
    assert_status(&harness.experiment(4).await, ExperimentStatus::Computing);
    harness.assert_not_orphaned(4).await;
    Ok(())
}

#[tokio::test]
async fn termination_after_a_locked_delivery_still_tears_down() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::computing(14, "env-14", "job-14"));
    let held = harness.store.lock(14).await?.into_row().expect("row");

    harness.schedule(TaskKind::ComputeMonitor, 14).await;
    assert_eq!(
        harness.run_next().await.expect("task")?,
        Disposition::Redelivered
    );
    drop(held);

    harness.orchestrator.request_termination(14).await?;
    assert_status(&harness.experiment(14).await, ExperimentStatus::Terminating);
    harness.assert_not_orphaned(14).await;

    let disposition = harness.run_next().await.expect("task")?;
    assert_eq!(disposition, Disposition::Finalized(ExperimentStatus::Failed));
    assert_failed_with(&harness.experiment(14).await, "terminated by user");
    assert_eq!(harness.lab.delete_env_count(), 1);
    Ok(())
}

/// Harness whose queue holds one task and is already full with another
/// experiment's monitor.
async fn full_queue_harness() -> TestHarness {
    let config = test_config();
    let queue = InMemoryTaskQueue::with_capacity(config.queue_name.clone(), 1);
    let harness = TestHarness::build_with_queue(config, RecordingNotifier::new(), queue);
    harness.insert(ExperimentFactory::creating_env(99, "env-99"));
    harness.schedule(TaskKind::EnvMonitor, 99).await;
    harness
}

#[tokio::test]
async fn unschedulable_compute_monitor_fails_and_tears_down() -> Result<()> {
    let harness = full_queue_harness().await;
    harness.insert(ExperimentFactory::creating_env(15, "env-15"));
    harness.lab.set_env_status(running_env(4));

    let envelope = harness
        .orchestrator
        .services()
        .envelope(TaskKind::EnvMonitor, 15);
    let disposition = harness.orchestrator.execute(envelope).await?;

    assert_eq!(disposition, Disposition::Finalized(ExperimentStatus::Failed));
    let experiment = harness.experiment(15).await;
    assert_failed_with(&experiment, "could not schedule experiment.compute_monitor");
    assert!(experiment.job_id().is_some());
    assert_eq!(harness.lab.submit_count(), 1);
    assert_eq!(harness.lab.delete_job_count(), 1);
    assert_eq!(harness.lab.deleted_envs(), vec!["env-15".to_string()]);
    assert!(harness.pending_for(15).is_empty());
    harness.assert_not_orphaned(15).await;
    Ok(())
}

#[tokio::test]
async fn unschedulable_reschedule_fails_the_experiment() -> Result<()> {
    let harness = full_queue_harness().await;
    harness.insert(ExperimentFactory::creating_env(16, "env-16"));
    harness.lab.set_env_status(running_env(2));

    let envelope = harness
        .orchestrator
        .services()
        .envelope(TaskKind::EnvMonitor, 16);
    let disposition = harness.orchestrator.execute(envelope).await?;

    assert_eq!(disposition, Disposition::Finalized(ExperimentStatus::Failed));
    assert_failed_with(
        &harness.experiment(16).await,
        "could not schedule experiment.env_monitor",
    );
    assert_eq!(harness.lab.submit_count(), 0);
    assert_eq!(harness.lab.deleted_envs(), vec!["env-16".to_string()]);
    harness.assert_not_orphaned(16).await;
    Ok(())
}

#[tokio::test]
async fn unschedulable_teardown_retry_notifies_operators() -> Result<()> {
    let harness = full_queue_harness().await;
    harness.insert(ExperimentFactory::creating_env(17, "env-17"));
    harness
        .lab
        .set_env_status(failed_env(0, 4))
        .on_delete_env(Err(LabError::Timeout));

    let envelope = harness
        .orchestrator
        .services()
        .envelope(TaskKind::EnvMonitor, 17);
    let disposition = harness.orchestrator.execute(envelope).await?;

    assert_eq!(disposition, Disposition::Finalized(ExperimentStatus::Failed));
    assert_terminal(&harness.experiment(17).await, ExperimentStatus::Failed);
    assert_eq!(harness.lab.delete_env_count(), 1);
    assert!(harness.pending_for(17).is_empty());
    assert_eq!(harness.notifier.attempts(), 1);
    let notices = harness.notifier.notices();
    assert_eq!(notices[0].env_id.as_deref(), Some("env-17"));
    Ok(())
}

#[tokio::test]
async fn missing_row_and_unknown_tasks_are_not_retried() -> Result<()> {
    let harness = TestHarness::new();

    harness.schedule(TaskKind::ComputeMonitor, 404).await;
    assert_eq!(
        harness.run_next().await.expect("task")?,
        Disposition::Skipped
    );

    let mut unknown = harness
        .orchestrator
        .services()
        .envelope(TaskKind::EnvMonitor, 404);
    unknown.name = "experiment.unknown".to_string();
    let err = harness
        .orchestrator
        .execute(unknown)
        .await
        .expect_err("no handler");
    assert!(matches!(err, Error::UnknownTask { .. }));

    let mut missing_arg = harness
        .orchestrator
        .services()
        .envelope(TaskKind::EnvMonitor, 404);
    missing_arg.args.clear();
    let err = harness
        .orchestrator
        .execute(missing_arg)
        .await
        .expect_err("no experiment id");
    assert!(matches!(err, Error::InvalidTaskArgument { .. }));

    assert!(harness.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn wire_envelope_is_accepted_by_the_dispatcher() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::creating_env(5, "env-5"));
    harness.lab.set_env_status(running_env(1));

    let wire = r#"{
        "Name": "experiment.env_monitor",
        "RoutingKey": "labrun_tasks",
        "UUID": "experiment_5",
        "ETA": "2024-01-01T00:00:00Z",
        "RetryCount": 0,
        "Args": [{"Name": "experiment_id", "Type": "int64", "Value": 5}]
    }"#;
    let envelope: TaskEnvelope =
        serde_json::from_str(wire).map_err(|e| Error::serialization(e.to_string()))?;

    let disposition = harness.orchestrator.execute(envelope).await?;
    assert_eq!(disposition, Disposition::Rescheduled);
    Ok(())
}

#[derive(Debug)]
struct Panicking(TaskKind);

#[async_trait]
impl TaskHandler for Panicking {
    fn kind(&self) -> TaskKind {
        self.0
    }

    fn locks_experiment(&self) -> bool {
        self.0 != TaskKind::Teardown
    }

    async fn step(&self, _ctx: StepContext<'_>) -> Result<StepOutcome> {
        panic!("handler bug");
    }
}

fn panicking_orchestrator(harness: &TestHarness, kind: TaskKind) -> Result<Arc<Orchestrator>> {
    let mut orchestrator = Orchestrator::new(
        test_config(),
        harness.store.clone(),
        harness.queue.clone(),
        harness.storage_backend(),
        Arc::new(StaticConnector::new(Arc::clone(&harness.lab))),
        Arc::new(RecordingNotifier::new()),
    )?;
    orchestrator.register(Arc::new(Panicking(kind)));
    Ok(Arc::new(orchestrator))
}

#[tokio::test]
async fn panicking_step_is_contained() -> Result<()> {
    let harness = TestHarness::new();
    let orchestrator = panicking_orchestrator(&harness, TaskKind::EnvMonitor)?;
    harness.insert(ExperimentFactory::creating_env(6, "env-6"));

    let mut envelope = orchestrator.services().envelope(TaskKind::EnvMonitor, 6);
    for attempt in 0..3 {
        assert_eq!(envelope.retry_count, attempt);
        assert_eq!(
            execute_contained(&orchestrator, envelope).await,
            Some(Disposition::Retried)
        );
        assert_status(&harness.experiment(6).await, ExperimentStatus::CreatingEnv);
        harness.assert_not_orphaned(6).await;
        envelope = harness.queue.take()?.expect("redelivered").envelope;
    }

    // The failure budget is spent: the experiment is failed and torn down.
    assert_eq!(envelope.retry_count, 3);
    assert_eq!(
        execute_contained(&orchestrator, envelope).await,
        Some(Disposition::Finalized(ExperimentStatus::Failed))
    );
    assert_failed_with(&harness.experiment(6).await, "experiment.env_monitor failed");
    assert_eq!(harness.lab.deleted_envs(), vec!["env-6".to_string()]);
    assert!(harness.pending().is_empty());

    // The same orchestrator keeps serving other deliveries.
    harness.insert(ExperimentFactory::computing(7, "env-7", "job-7"));
    let envelope = orchestrator.services().envelope(TaskKind::ComputeMonitor, 7);
    assert_eq!(
        execute_contained(&orchestrator, envelope).await,
        Some(Disposition::Rescheduled)
    );
    Ok(())
}

#[tokio::test]
async fn panicking_teardown_is_retried() -> Result<()> {
    let harness = TestHarness::new();
    let orchestrator = panicking_orchestrator(&harness, TaskKind::Teardown)?;
    let request = TeardownRequest {
        lab_address: TEST_LAB_ADDRESS.to_string(),
        env_id: Some("env-18".to_string()),
        job_id: None,
    };

    let envelope = orchestrator
        .services()
        .cleanup_envelope(TaskKind::Teardown, 18, &request);
    assert_eq!(
        execute_contained(&orchestrator, envelope).await,
        Some(Disposition::Retried)
    );
    let pending = harness.pending_for(18);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind(), Some(TaskKind::Teardown));
    assert_eq!(pending[0].retry_count, 1);
    Ok(())
}

#[tokio::test]
async fn drain_due_only_runs_tasks_whose_eta_passed() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::creating_env(8, "env-8"));
    harness.lab.set_env_status(running_env(4));
    harness.schedule(TaskKind::EnvMonitor, 8).await;

    let pool = WorkerPool::new(Arc::clone(&harness.orchestrator), harness.queue.clone());
    assert_eq!(pool.drain_due().await, 1);

    // The compute monitor is delayed and stays queued.
    assert_eq!(pool.drain_due().await, 0);
    assert_eq!(harness.pending_kinds(), vec![TaskKind::ComputeMonitor]);
    assert_status(&harness.experiment(8).await, ExperimentStatus::Computing);
    Ok(())
}

#[tokio::test]
async fn worker_pool_processes_until_shutdown() -> Result<()> {
    let harness = TestHarness::new();
    harness.insert(ExperimentFactory::creating_env(9, "env-9"));
    harness.lab.set_env_status(running_env(4));

    let pool = WorkerPool::new(Arc::clone(&harness.orchestrator), harness.queue.clone())
        .with_worker_count(2)
        .with_idle_poll(Duration::from_millis(5));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pool.spawn(&shutdown_rx);

    harness.schedule(TaskKind::EnvMonitor, 9).await;
    let mut status = ExperimentStatus::CreatingEnv;
    for _ in 0..200 {
        status = harness.store.get(9).await?.expect("row").status;
        if status == ExperimentStatus::Computing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, ExperimentStatus::Computing);

    shutdown_tx.send(true).expect("workers listening");
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker stops")
            .expect("worker exits cleanly");
    }
    assert_eq!(harness.lab.submit_count(), 1);
    Ok(())
}
