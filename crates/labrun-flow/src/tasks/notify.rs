//! Operator notification after teardown gives up.
//!
//! Attempt `n` (1-based) is carried by retry count `n - 1`. Once
//! `notify_max_attempts` attempts have failed the failure is logged and the
//! subsystem stops escalating.

use async_trait::async_trait;

use super::{Services, StepContext, StepOutcome, TaskHandler, TeardownRequest};
use crate::dispatch::TaskKind;
use crate::error::Result;
use crate::notify::TeardownFailureNotice;

/// Handler for `experiment.notify_teardown_failed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyTeardownFailed;

#[async_trait]
impl TaskHandler for NotifyTeardownFailed {
    fn kind(&self) -> TaskKind {
        TaskKind::NotifyTeardownFailed
    }

    fn locks_experiment(&self) -> bool {
        false
    }

    async fn step(&self, ctx: StepContext<'_>) -> Result<StepOutcome> {
        let notice = TeardownRequest::from_envelope(ctx.envelope)?.notice(ctx.experiment_id);
        Ok(attempt(ctx.services, &notice, ctx.envelope.retry_count).await)
    }
}

/// Sends the notice once and decides what follows.
pub async fn attempt(
    services: &Services,
    notice: &TeardownFailureNotice,
    retry_count: u32,
) -> StepOutcome {
    let delivered = services.notifier.send(notice).await;
    services.metrics.record_notification(delivered);
    if delivered {
        tracing::info!(experiment_id = notice.experiment_id, "operator notified of teardown failure");
        return StepOutcome::Done;
    }

    let attempts_made = retry_count.saturating_add(1);
    if attempts_made < services.config.notify_max_attempts {
        StepOutcome::Retry {
            delay: services.config.notify_retry_delay,
        }
    } else {
        tracing::error!(
            experiment_id = notice.experiment_id,
            env_id = notice.env_id.as_deref().unwrap_or_default(),
            job_id = notice.job_id.as_deref().unwrap_or_default(),
            lab_address = %notice.lab_address,
            attempts = attempts_made,
            "giving up on teardown failure notification"
        );
        StepOutcome::Done
    }
}
