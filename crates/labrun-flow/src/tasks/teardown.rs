//! Deletion reconciler: best-effort, retrying cleanup of the job and environment.
//!
//! An attempt succeeds only if both the job and the environment are gone
//! afterwards; "not found" counts as gone. A failed attempt with retry count
//! `n` is retried as attempt `n + 1` after the retry delay while
//! `n < teardown_max_retries`; the attempt carrying the maximum escalates to
//! an operator instead.

use async_trait::async_trait;

use super::{Services, StepContext, StepOutcome, TaskHandler, TeardownRequest};
use crate::dispatch::TaskKind;
use crate::error::Result;
use crate::lab::{LabError, LaboratoryClient};

/// Handler for `experiment.teardown`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Teardown;

#[async_trait]
impl TaskHandler for Teardown {
    fn kind(&self) -> TaskKind {
        TaskKind::Teardown
    }

    fn locks_experiment(&self) -> bool {
        false
    }

    async fn step(&self, ctx: StepContext<'_>) -> Result<StepOutcome> {
        let request = TeardownRequest::from_envelope(ctx.envelope)?;
        Ok(attempt(ctx.services, ctx.experiment_id, &request, ctx.envelope.retry_count).await)
    }
}

/// Runs one teardown attempt and decides what follows it.
pub async fn attempt(
    services: &Services,
    experiment_id: i64,
    request: &TeardownRequest,
    retry_count: u32,
) -> StepOutcome {
    if request.is_empty() {
        return StepOutcome::Done;
    }

    let lab = match services.lab(&request.lab_address) {
        Ok(lab) => lab,
        Err(error) => {
            tracing::warn!(experiment_id, %error, "cannot reach laboratory for teardown");
            return after_failure(services, experiment_id, request, retry_count);
        }
    };

    let job_gone = match &request.job_id {
        Some(job_id) => delete_job(lab.as_ref(), job_id).await,
        None => true,
    };
    let env_gone = match &request.env_id {
        Some(env_id) => settled(
            "delete environment",
            env_id,
            lab.delete_experiment_env(env_id).await,
        ),
        None => true,
    };

    if job_gone && env_gone {
        services.metrics.record_teardown("success");
        tracing::info!(experiment_id, retry_count, "teardown complete");
        StepOutcome::Done
    } else {
        after_failure(services, experiment_id, request, retry_count)
    }
}

fn after_failure(
    services: &Services,
    experiment_id: i64,
    request: &TeardownRequest,
    retry_count: u32,
) -> StepOutcome {
    if retry_count < services.config.teardown_max_retries {
        services.metrics.record_teardown("retry");
        tracing::warn!(
            experiment_id,
            retry_count,
            max_retries = services.config.teardown_max_retries,
            "teardown incomplete, will retry"
        );
        StepOutcome::Retry {
            delay: services.config.teardown_retry_delay,
        }
    } else {
        services.metrics.record_teardown("exhausted");
        tracing::error!(experiment_id, retry_count, "teardown retries exhausted");
        StepOutcome::Escalate(request.clone())
    }
}

/// Stops and deletes a job. Returns true if the job is gone.
async fn delete_job(lab: &dyn LaboratoryClient, job_id: &str) -> bool {
    match lab.query_experiment(job_id).await {
        Err(e) if e.is_not_found() => return true,
        Err(error) => {
            tracing::warn!(job_id, %error, "query job before deletion failed");
        }
        Ok(state) if state.is_active() => {
            if let Err(error) = lab.terminate_experiment(job_id).await {
                if error.is_not_found() {
                    return true;
                }
                tracing::warn!(job_id, %error, "terminate job failed");
            }
        }
        Ok(_) => {}
    }
    settled("delete job", job_id, lab.delete_experiment(job_id).await)
}

/// Treats success and "not found" as settled.
fn settled(action: &str, id: &str, result: std::result::Result<(), LabError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if e.is_not_found() => {
            tracing::debug!(action, id, "already gone");
            true
        }
        Err(error) => {
            tracing::warn!(action, id, %error, "teardown call failed");
            false
        }
    }
}
