//! Reconciliation tasks.
//!
//! Each task kind is a [`TaskHandler`] that inspects the world once and
//! returns a [`StepOutcome`]. Handlers never enqueue, persist or tear down on
//! their own; the [`Orchestrator`](crate::orchestrator::Orchestrator)
//! dispatcher applies the outcome. This keeps every exit path of a step
//! explicit: a non-terminal experiment either gets a follow-up task or a
//! teardown, never nothing.
//!
//! | Kind | Locks row | Outcomes |
//! |------|-----------|----------|
//! | env monitor | yes | `Reschedule`, `Advance` (→ compute monitor), `Terminal`, `Skip` |
//! | compute monitor | yes | `Reschedule`, `Terminal`, `Skip` |
//! | teardown | no | `Done`, `Retry`, `Escalate` |
//! | notify | no | `Done`, `Retry` |

pub mod compute_monitor;
pub mod env_monitor;
pub mod notify;
pub mod teardown;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use labrun_core::StorageBackend;

use crate::command::{CommandBuilder, experiment_prefix};
use crate::config::OrchestratorConfig;
use crate::convergence::{ConvergenceCheck, read_snapshot};
use crate::dispatch::{
    ARG_ENV_ID, ARG_EXPERIMENT_ID, ARG_JOB_ID, ARG_LAB_ADDRESS, TaskEnvelope, TaskKind, TaskQueue,
};
use crate::error::{Error, Result};
use crate::experiment::{Experiment, ExperimentPatch, ExperimentStatus, task_uuid};
use crate::lab::{LabConnector, LaboratoryClient};
use crate::metrics::FlowMetrics;
use crate::notify::{Notifier, TeardownFailureNotice};
use crate::store::ExperimentStore;

pub use compute_monitor::ComputeMonitor;
pub use env_monitor::EnvMonitor;
pub use notify::NotifyTeardownFailed;
pub use teardown::Teardown;

/// Remote resources to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownRequest {
    /// Laboratory address of the tenant.
    pub lab_address: String,
    /// Environment to delete; `None` if already gone.
    pub env_id: Option<String>,
    /// Job to stop and delete; `None` if never submitted or already gone.
    pub job_id: Option<String>,
}

impl TeardownRequest {
    /// Requests deletion of everything the experiment references.
    #[must_use]
    pub fn all(experiment: &Experiment) -> Self {
        Self {
            lab_address: experiment.lab_address.clone(),
            env_id: experiment.env_id().map(str::to_string),
            job_id: experiment.job_id().map(str::to_string),
        }
    }

    /// Drops the job from the request.
    #[must_use]
    pub fn without_job(mut self) -> Self {
        self.job_id = None;
        self
    }

    /// Drops the environment from the request.
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.env_id = None;
        self
    }

    /// Returns true if there is nothing to delete.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.env_id.is_none() && self.job_id.is_none()
    }

    /// Reads a request from teardown or notify task arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if an argument has the wrong type.
    pub fn from_envelope(envelope: &TaskEnvelope) -> Result<Self> {
        Ok(Self {
            lab_address: envelope.string_arg(ARG_LAB_ADDRESS)?.unwrap_or_default(),
            env_id: envelope.string_arg(ARG_ENV_ID)?,
            job_id: envelope.string_arg(ARG_JOB_ID)?,
        })
    }

    /// Builds the operator notice for this request.
    #[must_use]
    pub fn notice(&self, experiment_id: i64) -> TeardownFailureNotice {
        TeardownFailureNotice {
            experiment_id,
            env_id: self.env_id.clone(),
            job_id: self.job_id.clone(),
            lab_address: self.lab_address.clone(),
        }
    }
}

/// What the dispatcher must do after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Persist `patch` and run the same task again after `delay`.
    Reschedule {
        /// Delay before the next poll.
        delay: Duration,
        /// Opportunistic updates (convergence snapshot).
        patch: ExperimentPatch,
    },
    /// Persist `patch` and hand polling to the next phase.
    Advance {
        /// Phase-transition update.
        patch: ExperimentPatch,
        /// Task that owns the next phase.
        next: TaskKind,
        /// Delay before it runs.
        delay: Duration,
    },
    /// Tear down, then persist the terminal status.
    Terminal {
        /// `Failed` or `Succeeded`.
        status: ExperimentStatus,
        /// Failure reason for `err_msg`.
        err_msg: Option<String>,
        /// Extra fields to persist with the transition.
        patch: ExperimentPatch,
        /// Remote resources to delete first.
        teardown: Option<TeardownRequest>,
    },
    /// Run the same task again after `delay` with an incremented retry count.
    Retry {
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Teardown retries are exhausted; notify an operator about these resources.
    Escalate(TeardownRequest),
    /// The task finished its work.
    Done,
    /// The delivery is stale or a duplicate; discard it.
    Skip {
        /// Why the delivery was discarded.
        reason: String,
    },
}

impl StepOutcome {
    /// Builds a failed terminal outcome.
    #[must_use]
    pub fn failed(err_msg: impl Into<String>, teardown: Option<TeardownRequest>) -> Self {
        Self::Terminal {
            status: ExperimentStatus::Failed,
            err_msg: Some(err_msg.into()),
            patch: ExperimentPatch::new(),
            teardown,
        }
    }

    /// Builds a skip outcome.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }

    /// Returns a short label for logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Reschedule { .. } => "reschedule",
            Self::Advance { .. } => "advance",
            Self::Terminal { .. } => "terminal",
            Self::Retry { .. } => "retry",
            Self::Escalate(_) => "escalate",
            Self::Done => "done",
            Self::Skip { .. } => "skip",
        }
    }
}

/// Collaborators shared by every handler.
pub struct Services {
    /// Tunables.
    pub config: OrchestratorConfig,
    /// Experiment rows.
    pub store: Arc<dyn ExperimentStore>,
    /// Task queue for follow-up tasks.
    pub queue: Arc<dyn TaskQueue>,
    /// Object storage holding per-experiment files.
    pub storage: Arc<dyn StorageBackend>,
    /// Laboratory connector.
    pub connector: Arc<dyn LabConnector>,
    /// Operator notifier.
    pub notifier: Arc<dyn Notifier>,
    /// Command builder.
    pub commands: CommandBuilder,
    /// Final-output predicate.
    pub convergence: ConvergenceCheck,
    /// Metrics recorder.
    pub metrics: FlowMetrics,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .field("queue", &self.queue.queue_name())
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Returns a Laboratory client for the experiment's tenant.
    ///
    /// # Errors
    ///
    /// Returns a Laboratory error if the address is unusable.
    pub fn lab(&self, lab_address: &str) -> Result<Arc<dyn LaboratoryClient>> {
        Ok(self.connector.connect(lab_address)?)
    }

    /// Builds an envelope of `kind` for an experiment, due now.
    #[must_use]
    pub fn envelope(&self, kind: TaskKind, experiment_id: i64) -> TaskEnvelope {
        TaskEnvelope::new(kind, &self.config.queue_name, task_uuid(experiment_id))
            .with_int(ARG_EXPERIMENT_ID, experiment_id)
    }

    /// Builds a teardown or notify envelope carrying the request.
    #[must_use]
    pub fn cleanup_envelope(
        &self,
        kind: TaskKind,
        experiment_id: i64,
        request: &TeardownRequest,
    ) -> TaskEnvelope {
        self.envelope(kind, experiment_id)
            .with_string(ARG_ENV_ID, request.env_id.clone().unwrap_or_default())
            .with_string(ARG_JOB_ID, request.job_id.clone().unwrap_or_default())
            .with_string(ARG_LAB_ADDRESS, request.lab_address.clone())
    }

    /// Reads the latest convergence snapshot and returns a patch if it changed.
    pub async fn refresh_snapshot(&self, experiment: &Experiment) -> ExperimentPatch {
        let prefix = experiment_prefix(&self.config.storage_prefix, experiment);
        let Some(snapshot) = read_snapshot(self.storage.as_ref(), &prefix).await else {
            return ExperimentPatch::new();
        };
        match snapshot.to_json() {
            Ok(json) if json != experiment.oszicar_json => {
                ExperimentPatch::new().with_oszicar_json(json)
            }
            Ok(_) => ExperimentPatch::new(),
            Err(error) => {
                tracing::debug!(experiment_id = experiment.id, %error, "snapshot not serializable");
                ExperimentPatch::new()
            }
        }
    }
}

/// Input of one step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// The delivered envelope.
    pub envelope: &'a TaskEnvelope,
    /// The experiment id from the envelope.
    pub experiment_id: i64,
    /// The locked row, for handlers that lock.
    pub experiment: Option<&'a Experiment>,
    /// Shared collaborators.
    pub services: &'a Services,
}

impl<'a> StepContext<'a> {
    /// Returns the locked experiment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExperimentNotFound`] if the handler ran without a row.
    pub fn experiment(&self) -> Result<&'a Experiment> {
        self.experiment.ok_or(Error::ExperimentNotFound {
            experiment_id: self.experiment_id,
        })
    }
}

/// One reconciliation task kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> TaskKind;

    /// Whether the dispatcher must lock the experiment row around the step.
    fn locks_experiment(&self) -> bool {
        true
    }

    /// Runs one step.
    ///
    /// # Errors
    ///
    /// Errors are treated as transient: the dispatcher redelivers the same
    /// envelope after the redelivery delay without touching the row.
    async fn step(&self, ctx: StepContext<'_>) -> Result<StepOutcome>;
}

/// Returns the default handler for every task kind.
#[must_use]
pub fn default_handlers() -> Vec<Arc<dyn TaskHandler>> {
    vec![
        Arc::new(EnvMonitor),
        Arc::new(ComputeMonitor),
        Arc::new(Teardown),
        Arc::new(NotifyTeardownFailed),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_request_from_experiment() {
        let experiment = Experiment {
            id: 4,
            batch_env_id: "env-4".into(),
            lab_address: "lab:1".into(),
            ..Experiment::default()
        };
        let request = TeardownRequest::all(&experiment);
        assert_eq!(request.env_id.as_deref(), Some("env-4"));
        assert_eq!(request.job_id, None);
        assert!(!request.is_empty());
        assert!(request.without_env().is_empty());
    }

    #[test]
    fn teardown_request_roundtrips_through_args() {
        let envelope = TaskEnvelope::new(TaskKind::Teardown, "q", "experiment_4")
            .with_int(ARG_EXPERIMENT_ID, 4)
            .with_string(ARG_ENV_ID, "env-4")
            .with_string(ARG_JOB_ID, "")
            .with_string(ARG_LAB_ADDRESS, "lab:1");
        let request = TeardownRequest::from_envelope(&envelope).expect("args");
        assert_eq!(
            request,
            TeardownRequest {
                lab_address: "lab:1".into(),
                env_id: Some("env-4".into()),
                job_id: None,
            }
        );
        assert_eq!(request.notice(4).experiment_id, 4);
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(StepOutcome::skip("stale").as_label(), "skip");
        assert_eq!(StepOutcome::failed("x", None).as_label(), "terminal");
        assert_eq!(StepOutcome::Done.as_label(), "done");
    }

    #[test]
    fn default_handlers_cover_every_kind() {
        let kinds: Vec<_> = default_handlers().iter().map(|h| h.kind()).collect();
        for kind in TaskKind::ALL {
            assert!(kinds.contains(&kind));
        }
    }
}
