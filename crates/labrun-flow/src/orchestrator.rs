//! The orchestrator: submission, termination requests, and the task dispatcher.
//!
//! [`Orchestrator::execute`] is the single entry point for every delivered
//! task. It resolves the handler, takes the row lock when the handler needs
//! one, runs the step and applies the returned [`StepOutcome`]:
//!
//! - persisting patches through the locked row
//! - enqueueing follow-up tasks
//! - running teardown inline before a terminal status is written
//! - escalating to operator notification when teardown gives up
//!
//! Failures inside a step are caught here. Transient ones and deliveries that
//! find their row locked redeliver the same envelope after the redelivery
//! delay. Other failures go through [`Orchestrator::recover`], which retries a
//! bounded number of times and then fails the experiment with a teardown.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use labrun_core::StorageBackend;
use labrun_core::observability::{experiment_span, project_span};

use crate::command::CommandBuilder;
use crate::config::OrchestratorConfig;
use crate::convergence::ConvergenceCheck;
use crate::dispatch::{ARG_EXPERIMENT_ID, EnqueueResult, TaskEnvelope, TaskKind, TaskQueue};
use crate::error::{Error, Result};
use crate::experiment::{Experiment, ExperimentPatch, ExperimentStatus};
use crate::guard::SubmissionGuard;
use crate::lab::{EnvRequest, LabConnector, LaboratoryClient};
use crate::metrics::{FlowMetrics, StepTimer};
use crate::notify::Notifier;
use crate::store::{ExperimentRow, ExperimentStore, RowLock};
use crate::tasks::{
    Services, StepContext, StepOutcome, TaskHandler, TeardownRequest, default_handlers, notify,
    teardown,
};

/// What the dispatcher did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The same task was scheduled again.
    Rescheduled,
    /// The next phase's task was scheduled.
    Advanced(TaskKind),
    /// The experiment reached a terminal status.
    Finalized(ExperimentStatus),
    /// The same task was scheduled again with a higher retry count.
    Retried,
    /// Teardown gave up and operator notification started.
    Escalated,
    /// The task finished its work.
    Completed,
    /// The delivery was stale or its experiment no longer exists.
    Skipped,
    /// The step failed transiently or found its row locked, and the
    /// envelope was redelivered.
    Redelivered,
}

impl Disposition {
    /// Returns a short label for logs and metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Rescheduled => "rescheduled",
            Self::Advanced(_) => "advanced",
            Self::Finalized(_) => "finalized",
            Self::Retried => "retried",
            Self::Escalated => "escalated",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Redelivered => "redelivered",
        }
    }
}

/// Drives experiments through their lifecycle.
pub struct Orchestrator {
    services: Services,
    guard: SubmissionGuard,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("Orchestrator")
            .field("services", &self.services)
            .field("handlers", &handlers)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator with the default handler for every task kind.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn ExperimentStore>,
        queue: Arc<dyn TaskQueue>,
        storage: Arc<dyn StorageBackend>,
        connector: Arc<dyn LabConnector>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let commands = CommandBuilder::new(Arc::clone(&storage), &config)?;
        let convergence = ConvergenceCheck::new(&config.convergence_pattern)?;
        let guard = SubmissionGuard::from_config(Arc::clone(&storage), &config);

        let mut orchestrator = Self {
            services: Services {
                config,
                store,
                queue,
                storage,
                connector,
                notifier,
                commands,
                convergence,
                metrics: FlowMetrics::new(),
            },
            guard,
            handlers: HashMap::new(),
        };
        for handler in default_handlers() {
            orchestrator.register(handler);
        }
        Ok(orchestrator)
    }

    /// Registers a handler, replacing any handler for the same kind.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind().name(), handler);
    }

    /// Returns the shared collaborators.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.services.config
    }

    /// Submits a draft experiment: picks a zone, prepares the image, creates
    /// the environment and starts monitoring it.
    ///
    /// The zone choice, image sharing and environment creation run under the
    /// project's submission guard.
    ///
    /// # Errors
    ///
    /// Returns an error if the experiment is missing or not a draft, the
    /// guard is busy, the project is at its environment limit, no zone is
    /// available, or a Laboratory, queue or store call fails.
    pub async fn submit(&self, experiment_id: i64) -> Result<Experiment> {
        let experiment = self.load_draft(experiment_id).await?;

        let span = project_span("submit", experiment.project_id);
        let result = self
            .guard
            .run(experiment.project_id, || self.create_environment(experiment_id))
            .instrument(span)
            .await;
        self.services
            .metrics
            .record_submission(if result.is_ok() { "success" } else { "failure" });
        result
    }

    async fn load_draft(&self, experiment_id: i64) -> Result<Experiment> {
        let experiment = self
            .services
            .store
            .get(experiment_id)
            .await?
            .ok_or(Error::ExperimentNotFound { experiment_id })?;
        if experiment.status != ExperimentStatus::Draft {
            return Err(Error::InvalidExperimentState {
                experiment_id,
                status: experiment.status,
                action: "submit",
            });
        }
        Ok(experiment)
    }

    async fn create_environment(&self, experiment_id: i64) -> Result<Experiment> {
        // A previous holder of the guard may have submitted it already.
        let experiment = &self.load_draft(experiment_id).await?;
        let services = &self.services;
        let limit = services.config.max_active_environments_per_project;
        let active = services
            .store
            .count_active_in_project(experiment.project_id)
            .await?;
        if active >= limit {
            return Err(Error::EnvironmentLimitReached {
                project_id: experiment.project_id,
                active,
                limit,
            });
        }

        let lab = services.lab(&experiment.lab_address)?;
        let available = lab.available_zone_list().await?;
        let zone = choose_zone(&experiment.zone, &services.config.preferred_zones, &available)
            .ok_or_else(|| Error::NoAvailableZone {
                instance_type: experiment.instance_type.clone(),
            })?;

        let image = lab.cvm_image(&experiment.image_id).await?;
        if !experiment.lab_account.is_empty() && image.owner_account != experiment.lab_account {
            lab.share_cvm_image(&image.image_id, &experiment.lab_account)
                .await?;
            tracing::info!(image_id = %image.image_id, "image shared with tenant account");
        }

        let env_id = lab
            .create_experiment_env(&EnvRequest {
                node_count: experiment.compute_node_num,
                disk_size_gb: experiment.disk_size_gb,
                input_path: experiment.input_path.clone(),
                image_id: experiment.image_id.clone(),
                zone: zone.clone(),
                instance_type: experiment.instance_type.clone(),
                disk_type: experiment.disk_type.clone(),
            })
            .await?;
        tracing::info!(experiment_id = experiment.id, %env_id, %zone, "environment requested");

        // The monitor must exist before the row says creating_env.
        let monitor = services
            .envelope(TaskKind::EnvMonitor, experiment.id)
            .delayed_by(services.config.env_monitor_initial_delay);
        if let Err(error) = self.enqueue(monitor).await {
            release_environment(lab.as_ref(), &env_id).await;
            return Err(error);
        }

        let patch = ExperimentPatch::new()
            .with_status(ExperimentStatus::CreatingEnv)
            .with_env_id(&env_id)
            .with_zone(zone)
            .with_start_at(Utc::now().timestamp());
        match self.persist_submission(experiment.id, &patch).await {
            Ok(updated) => {
                services.metrics.record_status_transition(
                    ExperimentStatus::Draft.as_label(),
                    ExperimentStatus::CreatingEnv.as_label(),
                );
                Ok(updated)
            }
            Err(error) => {
                release_environment(lab.as_ref(), &env_id).await;
                Err(error)
            }
        }
    }

    async fn persist_submission(
        &self,
        experiment_id: i64,
        patch: &ExperimentPatch,
    ) -> Result<Experiment> {
        let mut row = self
            .services
            .store
            .lock(experiment_id)
            .await?
            .into_row()
            .ok_or(Error::ExperimentNotFound { experiment_id })?;
        let status = row.experiment().status;
        if status != ExperimentStatus::Draft {
            return Err(Error::InvalidExperimentState {
                experiment_id,
                status,
                action: "submit",
            });
        }
        row.update(patch).await?;
        Ok(row.experiment().clone())
    }

    /// Marks a running experiment for termination.
    ///
    /// The next monitor delivery tears it down and moves it to `failed`.
    /// Requesting termination twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the experiment is missing or not running.
    pub async fn request_termination(&self, experiment_id: i64) -> Result<Experiment> {
        let mut row = self
            .services
            .store
            .lock(experiment_id)
            .await?
            .into_row()
            .ok_or(Error::ExperimentNotFound { experiment_id })?;

        match row.experiment().status {
            ExperimentStatus::CreatingEnv | ExperimentStatus::Computing => {
                let from = row.experiment().status;
                row.update(&ExperimentPatch::new().with_status(ExperimentStatus::Terminating))
                    .await?;
                self.services
                    .metrics
                    .record_status_transition(from.as_label(), ExperimentStatus::Terminating.as_label());
                tracing::info!(experiment_id, %from, "termination requested");
            }
            ExperimentStatus::Terminating => {}
            status => {
                return Err(Error::InvalidExperimentState {
                    experiment_id,
                    status,
                    action: "terminate",
                });
            }
        }
        Ok(row.experiment().clone())
    }

    /// Runs one delivered task.
    ///
    /// # Errors
    ///
    /// Returns an error if no handler serves the task, its arguments are
    /// invalid, or a failed step could not be recovered. Such deliveries are
    /// not retried.
    pub async fn execute(&self, envelope: TaskEnvelope) -> Result<Disposition> {
        let handler = self
            .handlers
            .get(envelope.name.as_str())
            .cloned()
            .ok_or_else(|| Error::UnknownTask {
                name: envelope.name.clone(),
            })?;
        let experiment_id = envelope.int_arg(ARG_EXPERIMENT_ID)?;
        let label = handler.kind().as_label();
        let span = experiment_span(label, experiment_id, &envelope.uuid);
        let timer = StepTimer::start(label);

        let result = async {
            match self.run_step(handler.as_ref(), &envelope, experiment_id).await {
                Err(error) if error.is_transient() => {
                    tracing::warn!(%error, retry_count = envelope.retry_count, "step failed, redelivering");
                    self.enqueue(
                        envelope
                            .clone()
                            .delayed_by(self.services.config.redelivery_delay),
                    )
                    .await?;
                    Ok(Disposition::Redelivered)
                }
                Err(error) => {
                    tracing::error!(%error, retry_count = envelope.retry_count, "step failed");
                    self.recover(&envelope, &error.to_string()).await
                }
                Ok(disposition) => {
                    tracing::debug!(disposition = disposition.as_label(), "step applied");
                    Ok(disposition)
                }
            }
        }
        .instrument(span)
        .await;

        let outcome = match &result {
            Ok(disposition) => disposition.as_label(),
            Err(_) => "error",
        };
        timer.finish(&self.services.metrics, outcome);
        result
    }

    async fn run_step(
        &self,
        handler: &dyn TaskHandler,
        envelope: &TaskEnvelope,
        experiment_id: i64,
    ) -> Result<Disposition> {
        if !handler.locks_experiment() {
            let outcome = handler
                .step(StepContext {
                    envelope,
                    experiment_id,
                    experiment: None,
                    services: &self.services,
                })
                .await?;
            return self.apply_followup(envelope, experiment_id, outcome).await;
        }

        let mut row = match self.services.store.try_lock(experiment_id).await? {
            RowLock::Acquired(row) => row,
            RowLock::Busy => {
                tracing::debug!("row locked by another step, redelivering");
                self.enqueue(
                    envelope
                        .clone()
                        .delayed_by(self.services.config.redelivery_delay),
                )
                .await?;
                return Ok(Disposition::Redelivered);
            }
            RowLock::NotFound => {
                tracing::warn!("experiment row missing, discarding delivery");
                return Ok(Disposition::Skipped);
            }
        };

        let experiment = row.experiment();
        let outcome = handler
            .step(StepContext {
                envelope,
                experiment_id,
                experiment: Some(experiment),
                services: &self.services,
            })
            .await?;
        self.apply_locked(row.as_mut(), envelope, experiment_id, outcome)
            .await
    }

    async fn apply_locked(
        &self,
        row: &mut dyn ExperimentRow,
        envelope: &TaskEnvelope,
        experiment_id: i64,
        outcome: StepOutcome,
    ) -> Result<Disposition> {
        let services = &self.services;
        // Follow-ups are queued before the row changes, so an active row
        // always has a task behind it.
        match outcome {
            StepOutcome::Reschedule { delay, patch } => {
                let next = envelope.clone().with_retry_count(0).delayed_by(delay);
                if let Err(error) = self.enqueue(next).await {
                    return self
                        .fail_unschedulable(row, experiment_id, &envelope.name, &error, patch)
                        .await;
                }
                if let Err(error) = row.update(&patch).await {
                    tracing::warn!(%error, "snapshot update failed");
                }
                Ok(Disposition::Rescheduled)
            }
            StepOutcome::Advance { patch, next, delay } => {
                let follow_up = services.envelope(next, experiment_id).delayed_by(delay);
                if let Err(error) = self.enqueue(follow_up).await {
                    return self
                        .fail_unschedulable(row, experiment_id, next.name(), &error, patch)
                        .await;
                }
                let from = row.experiment().status;
                row.update(&patch).await?;
                self.record_transition(from, row.experiment().status);
                tracing::info!(next = next.as_label(), "phase advanced");
                Ok(Disposition::Advanced(next))
            }
            StepOutcome::Terminal {
                status,
                err_msg,
                patch,
                teardown: request,
            } => {
                self.finalize(row, experiment_id, status, err_msg, patch, request)
                    .await
            }
            other => self.apply_followup(envelope, experiment_id, other).await,
        }
    }

    /// Tears down inline, then writes the terminal status.
    ///
    /// A teardown that cannot be retried through the queue goes straight to
    /// operator notification.
    async fn finalize(
        &self,
        row: &mut dyn ExperimentRow,
        experiment_id: i64,
        status: ExperimentStatus,
        err_msg: Option<String>,
        patch: ExperimentPatch,
        request: Option<TeardownRequest>,
    ) -> Result<Disposition> {
        let services = &self.services;
        let request = request.filter(|request| !request.is_empty());
        let cleanup = match &request {
            Some(request) => Some(teardown::attempt(services, experiment_id, request, 0).await),
            None => None,
        };

        let from = row.experiment().status;
        let terminal = patch.merge(ExperimentPatch::terminal(
            status,
            Utc::now().timestamp(),
            err_msg,
        ));
        row.update(&terminal).await?;
        self.record_transition(from, status);
        tracing::info!(%from, to = %status, err_msg = %row.experiment().err_msg, "experiment finished");

        if let (Some(request), Some(outcome)) = (request, cleanup) {
            let retrying = matches!(outcome, StepOutcome::Retry { .. });
            let envelope = services.cleanup_envelope(TaskKind::Teardown, experiment_id, &request);
            if let Err(error) = self
                .apply_followup(&envelope, experiment_id, outcome)
                .await
            {
                tracing::error!(%error, "could not schedule teardown follow-up");
                if retrying {
                    if let Err(error) = self.escalate(experiment_id, &request).await {
                        tracing::error!(%error, "could not schedule notification retry");
                    }
                }
            }
        }
        Ok(Disposition::Finalized(status))
    }

    /// Fails the experiment because the task owning its next poll could not
    /// be queued.
    async fn fail_unschedulable(
        &self,
        row: &mut dyn ExperimentRow,
        experiment_id: i64,
        task: &str,
        error: &Error,
        patch: ExperimentPatch,
    ) -> Result<Disposition> {
        tracing::error!(%error, task, "could not schedule follow-up, failing experiment");
        let mut request = TeardownRequest::all(row.experiment());
        if let Some(job_id) = patch.batch_job_id.as_ref().filter(|id| !id.is_empty()) {
            request.job_id = Some(job_id.clone());
        }
        let patch = ExperimentPatch {
            status: None,
            ..patch
        };
        self.finalize(
            row,
            experiment_id,
            ExperimentStatus::Failed,
            Some(format!("could not schedule {task}: {error}")),
            patch,
            Some(request),
        )
        .await
    }

    /// Handles a delivery whose step failed permanently or panicked.
    ///
    /// Monitors are redelivered with a raised retry count until
    /// `max_step_failures` is reached; then the experiment is failed and torn
    /// down. Teardown keeps its own retry budget and escalates when it runs
    /// out. A failed notification is logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is unknown or malformed, or if the
    /// row cannot be read or written.
    pub async fn recover(&self, envelope: &TaskEnvelope, reason: &str) -> Result<Disposition> {
        let kind = envelope.kind().ok_or_else(|| Error::UnknownTask {
            name: envelope.name.clone(),
        })?;
        let experiment_id = envelope.int_arg(ARG_EXPERIMENT_ID)?;
        let config = &self.services.config;

        match kind {
            TaskKind::EnvMonitor | TaskKind::ComputeMonitor => {
                if envelope.retry_count < config.max_step_failures {
                    let retry = envelope
                        .clone()
                        .with_retry_count(envelope.retry_count.saturating_add(1))
                        .delayed_by(config.redelivery_delay);
                    match self.enqueue(retry).await {
                        Ok(()) => return Ok(Disposition::Retried),
                        Err(error) => tracing::error!(%error, "could not redeliver failed step"),
                    }
                }
                self.abandon(experiment_id, &format!("{kind} failed: {reason}"))
                    .await
            }
            TaskKind::Teardown => {
                let request = TeardownRequest::from_envelope(envelope)?;
                let outcome = if envelope.retry_count < config.teardown_max_retries {
                    StepOutcome::Retry {
                        delay: config.teardown_retry_delay,
                    }
                } else {
                    StepOutcome::Escalate(request)
                };
                self.apply_followup(envelope, experiment_id, outcome).await
            }
            TaskKind::NotifyTeardownFailed => {
                tracing::error!(experiment_id, %reason, "operator notification failed, giving up");
                Ok(Disposition::Completed)
            }
        }
    }

    /// Fails an experiment whose monitor keeps failing and tears it down.
    async fn abandon(&self, experiment_id: i64, err_msg: &str) -> Result<Disposition> {
        let Some(mut row) = self.services.store.lock(experiment_id).await?.into_row() else {
            return Ok(Disposition::Skipped);
        };
        let experiment = row.experiment();
        if !experiment.status.is_active() {
            return Ok(Disposition::Skipped);
        }
        let request = TeardownRequest::all(experiment);
        self.finalize(
            row.as_mut(),
            experiment_id,
            ExperimentStatus::Failed,
            Some(err_msg.to_string()),
            ExperimentPatch::new(),
            Some(request),
        )
        .await
    }

    /// Applies outcomes that never touch the row.
    async fn apply_followup(
        &self,
        envelope: &TaskEnvelope,
        experiment_id: i64,
        outcome: StepOutcome,
    ) -> Result<Disposition> {
        match outcome {
            StepOutcome::Retry { delay } => {
                let next = envelope
                    .clone()
                    .with_retry_count(envelope.retry_count.saturating_add(1))
                    .delayed_by(delay);
                self.enqueue(next).await?;
                Ok(Disposition::Retried)
            }
            StepOutcome::Escalate(request) => {
                self.escalate(experiment_id, &request).await?;
                Ok(Disposition::Escalated)
            }
            StepOutcome::Done => Ok(Disposition::Completed),
            StepOutcome::Skip { reason } => {
                tracing::debug!(%reason, "delivery discarded");
                Ok(Disposition::Skipped)
            }
            StepOutcome::Reschedule { .. }
            | StepOutcome::Advance { .. }
            | StepOutcome::Terminal { .. } => Err(Error::dispatch(format!(
                "{} returned {} without holding the experiment row",
                envelope.name,
                outcome.as_label()
            ))),
        }
    }

    /// Makes the first notification attempt and schedules the rest.
    async fn escalate(&self, experiment_id: i64, request: &TeardownRequest) -> Result<()> {
        let services = &self.services;
        let outcome = notify::attempt(services, &request.notice(experiment_id), 0).await;
        if let StepOutcome::Retry { delay } = outcome {
            let next = services
                .cleanup_envelope(TaskKind::NotifyTeardownFailed, experiment_id, request)
                .with_retry_count(1)
                .delayed_by(delay);
            self.enqueue(next).await?;
        }
        Ok(())
    }

    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        let queue = &self.services.queue;
        let name = envelope.name.clone();
        let result = queue.enqueue(envelope).await?;
        if let Ok(depth) = queue.queue_depth().await {
            self.services.metrics.set_queue_depth(queue.queue_name(), depth);
        }
        match result {
            EnqueueResult::Enqueued { .. } => Ok(()),
            EnqueueResult::Deduplicated {
                existing_message_id,
            } => {
                tracing::debug!(task = %name, %existing_message_id, "identical task already pending");
                Ok(())
            }
            EnqueueResult::QueueFull => Err(Error::dispatch(format!(
                "queue {} is full, cannot enqueue {name}",
                queue.queue_name()
            ))),
        }
    }

    fn record_transition(&self, from: ExperimentStatus, to: ExperimentStatus) {
        if from != to {
            self.services
                .metrics
                .record_status_transition(from.as_label(), to.as_label());
        }
    }
}

/// Deletes an environment created by a submission that could not complete.
async fn release_environment(lab: &dyn LaboratoryClient, env_id: &str) {
    match lab.delete_experiment_env(env_id).await {
        Ok(()) => tracing::info!(env_id, "released environment of failed submission"),
        Err(error) => {
            tracing::error!(env_id, %error, "could not release environment of failed submission");
        }
    }
}

/// Picks the zone for a new environment.
///
/// The experiment's own zone wins if the provider offers it, then the first
/// offered preferred zone, then the first offered zone.
#[must_use]
pub fn choose_zone(requested: &str, preferred: &[String], available: &[String]) -> Option<String> {
    let offered = |zone: &str| available.iter().any(|z| z == zone);
    if !requested.is_empty() && offered(requested) {
        return Some(requested.to_string());
    }
    preferred
        .iter()
        .find(|zone| offered(zone))
        .or_else(|| available.first())
        .cloned()
}
