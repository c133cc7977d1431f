//! Fixed-size worker pool pulling due tasks from a [`TaskSource`].
//!
//! Each worker runs one task at a time. A task is executed on its own spawned
//! tokio task so that a panic inside a step is contained to that delivery:
//! the worker logs it, lets the orchestrator recover the experiment and moves
//! on to the next envelope.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch::{TaskEnvelope, TaskSource};
use crate::orchestrator::{Disposition, Orchestrator};

/// Pool of executors that drain a task source through an orchestrator.
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    source: Arc<dyn TaskSource>,
    worker_count: usize,
    idle_poll: Duration,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("idle_poll", &self.idle_poll)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool sized from the orchestrator's configuration.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, source: Arc<dyn TaskSource>) -> Self {
        let worker_count = orchestrator.config().worker_count.max(1);
        let idle_poll = orchestrator.config().worker_idle_poll;
        Self {
            orchestrator,
            source,
            worker_count,
            idle_poll,
        }
    }

    /// Overrides the number of workers.
    #[must_use]
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    /// Overrides how long an idle worker sleeps before polling again.
    #[must_use]
    pub const fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Starts the workers. They stop once `shutdown` carries `true` or its
    /// sender is dropped.
    #[must_use]
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.worker_count)
            .map(|worker| {
                let orchestrator = Arc::clone(&self.orchestrator);
                let source = Arc::clone(&self.source);
                let shutdown = shutdown.clone();
                let idle_poll = self.idle_poll;
                tokio::spawn(async move {
                    worker_loop(worker, orchestrator, source, idle_poll, shutdown).await;
                })
            })
            .collect()
    }

    /// Runs the workers until shutdown and waits for them to finish.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        for handle in self.spawn(&shutdown) {
            if let Err(error) = handle.await {
                tracing::error!(%error, "worker exited abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }

    /// Executes every task that is due now, one after another.
    ///
    /// Returns the number of deliveries processed.
    pub async fn drain_due(&self) -> usize {
        let mut processed = 0;
        loop {
            match self.source.next_due(Utc::now()).await {
                Ok(Some(envelope)) => {
                    execute_contained(&self.orchestrator, envelope).await;
                    processed += 1;
                }
                Ok(None) => return processed,
                Err(error) => {
                    tracing::warn!(%error, "task source unavailable");
                    return processed;
                }
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    orchestrator: Arc<Orchestrator>,
    source: Arc<dyn TaskSource>,
    idle_poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(worker, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = match source.next_due(Utc::now()).await {
            Ok(next) => next,
            Err(error) => {
                tracing::warn!(worker, %error, "task source unavailable");
                None
            }
        };

        if let Some(envelope) = next {
            execute_contained(&orchestrator, envelope).await;
            continue;
        }

        tokio::select! {
            () = tokio::time::sleep(idle_poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(worker, "worker stopped");
}

/// Executes one envelope on its own tokio task.
///
/// A panic inside the step is contained to that task and handed to
/// [`Orchestrator::recover`] like any other failed step. Returns `None` when
/// the delivery failed and could not be recovered; the error is logged.
pub async fn execute_contained(
    orchestrator: &Arc<Orchestrator>,
    envelope: TaskEnvelope,
) -> Option<Disposition> {
    let task = envelope.name.clone();
    let uuid = envelope.uuid.clone();
    let delivered = envelope.clone();
    let executor = Arc::clone(orchestrator);

    let error = match tokio::spawn(async move { executor.execute(envelope).await }).await {
        Ok(Ok(disposition)) => return Some(disposition),
        Ok(Err(error)) => {
            tracing::error!(%task, %uuid, %error, "task failed");
            return None;
        }
        Err(error) => error,
    };

    tracing::error!(%task, %uuid, panicked = error.is_panic(), %error, "task aborted");
    match orchestrator.recover(&delivered, &error.to_string()).await {
        Ok(disposition) => Some(disposition),
        Err(error) => {
            tracing::error!(%task, %uuid, %error, "could not recover aborted task");
            None
        }
    }
}
