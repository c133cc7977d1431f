//! Environment Monitor: waits for provisioning, then launches the job.

use async_trait::async_trait;

use super::{StepContext, StepOutcome, TaskHandler, TeardownRequest};
use crate::command::Topology;
use crate::dispatch::TaskKind;
use crate::error::Result;
use crate::experiment::{ExperimentPatch, ExperimentStatus};

/// Handler for `experiment.env_monitor`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvMonitor;

#[async_trait]
impl TaskHandler for EnvMonitor {
    fn kind(&self) -> TaskKind {
        TaskKind::EnvMonitor
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
            ExperimentStatus::CreatingEnv => {}
            status => {
                return Ok(StepOutcome::skip(format!(
                    "environment monitor delivered in status {status}"
                )));
            }
        }

        let Some(env_id) = experiment.env_id() else {
            return Ok(StepOutcome::failed("environment id is missing", None));
        };

        let lab = services.lab(&experiment.lab_address)?;
        let env = match lab.query_experiment_env(env_id).await {
            Ok(env) => env,
            Err(e) if e.is_not_found() => {
                tracing::warn!(env_id, "environment vanished on the provider side");
                return Ok(StepOutcome::failed(
                    format!("environment {env_id} no longer exists"),
                    None,
                ));
            }
            Err(e) => return Err(e.into()),
        };

        if env.has_failed_nodes() {
            return Ok(StepOutcome::failed(
                format!(
                    "environment creation failed: {} node(s) failed to create, {} abnormal",
                    env.creation_failed_count, env.abnormal_count
                ),
                Some(TeardownRequest::all(experiment)),
            ));
        }

        if env.running_count < experiment.compute_node_num {
            tracing::debug!(
                running = env.running_count,
                requested = experiment.compute_node_num,
                "environment still provisioning"
            );
            return Ok(StepOutcome::Reschedule {
                delay: services.config.env_poll_interval,
                patch: services.refresh_snapshot(experiment).await,
            });
        }

        let topology = Topology::from_nodes(&env.nodes);
        match services
            .commands
            .launch(lab.as_ref(), experiment, &topology)
            .await
        {
            Ok(job_id) => Ok(StepOutcome::Advance {
                patch: ExperimentPatch::new()
                    .with_status(ExperimentStatus::Computing)
                    .with_job_id(job_id),
                next: TaskKind::ComputeMonitor,
                delay: services.config.compute_monitor_initial_delay,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "job launch failed");
                Ok(StepOutcome::failed(
                    e.to_string(),
                    Some(TeardownRequest::all(experiment)),
                ))
            }
        }
    }
}
