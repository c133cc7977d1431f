//! Compute Monitor: follows the job to completion and checks convergence.

use async_trait::async_trait;

use super::{StepContext, StepOutcome, TaskHandler, TeardownRequest};
use crate::command::experiment_prefix;
use crate::convergence::ConvergenceVerdict;
use crate::dispatch::TaskKind;
use crate::error::Result;
use crate::experiment::ExperimentStatus;
use crate::lab::JobState;

/// Handler for `experiment.compute_monitor`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeMonitor;

#[async_trait]
impl TaskHandler for ComputeMonitor {
    fn kind(&self) -> TaskKind {
        TaskKind::ComputeMonitor
    }

    async fn step(&self, ctx: StepContext<'_>) -> Result<StepOutcome> {
        let experiment = ctx.experiment()?;
        let services = ctx.services;

        match experiment.status {
            ExperimentStatus::Terminating => {
                return Ok(StepOutcome::failed(
                    "terminated by user",
                    Some(TeardownRequest::all(experiment)),
                ));
            }
            ExperimentStatus::Computing => {}
            status => {
                return Ok(StepOutcome::skip(format!(
                    "compute monitor delivered in status {status}"
                )));
            }
        }

        let Some(job_id) = experiment.job_id() else {
            return Ok(StepOutcome::failed(
                "job id is missing",
                Some(TeardownRequest::all(experiment)),
            ));
        };

        let lab = services.lab(&experiment.lab_address)?;
        let state = match lab.query_experiment(job_id).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                tracing::warn!(job_id, "job vanished on the provider side");
                return Ok(StepOutcome::failed(
                    format!("job {job_id} no longer exists"),
                    Some(TeardownRequest::all(experiment).without_job()),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        match state {
            JobState::Pending | JobState::Starting | JobState::Running => {
                Ok(StepOutcome::Reschedule {
                    delay: services.config.compute_poll_interval,
                    patch: services.refresh_snapshot(experiment).await,
                })
            }
            JobState::Failed => Ok(StepOutcome::failed(
                "job failed on the provider",
                Some(TeardownRequest::all(experiment)),
            )),
            JobState::Succeeded => {
                let prefix = experiment_prefix(&services.config.storage_prefix, experiment);
                let verdict = services
                    .convergence
                    .evaluate(&services.storage, &prefix)
                    .await?;
                let patch = services.refresh_snapshot(experiment).await;
                let teardown = Some(TeardownRequest::all(experiment));
                Ok(match verdict {
                    ConvergenceVerdict::Converged => StepOutcome::Terminal {
                        status: ExperimentStatus::Succeeded,
                        err_msg: None,
                        patch,
                        teardown,
                    },
                    ConvergenceVerdict::NotConverged { reason } => StepOutcome::Terminal {
                        status: ExperimentStatus::Failed,
                        err_msg: Some(reason),
                        patch,
                        teardown,
                    },
                })
            }
        }
    }
}
