//! Submission Guard: one distributed lock per project.
//!
//! Serializes the "check limits → pick zone → share image → create
//! environment" section of concurrent submissions for the same project.
//! Unrelated projects never contend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use labrun_core::{DistributedLock, StorageBackend};

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};

/// Returns the lock record path of a project.
#[must_use]
pub fn submission_lock_path(project_id: i64) -> String {
    format!("locks/projects/{project_id}/submission.lock")
}

/// Per-project submission lock.
#[derive(Clone)]
pub struct SubmissionGuard {
    storage: Arc<dyn StorageBackend>,
    ttl: Duration,
    poll_interval: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for SubmissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionGuard")
            .field("ttl", &self.ttl)
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SubmissionGuard {
    /// Creates a guard with explicit timings.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        ttl: Duration,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            ttl,
            poll_interval,
            timeout,
        }
    }

    /// Creates a guard with the configured timings.
    #[must_use]
    pub fn from_config(storage: Arc<dyn StorageBackend>, config: &OrchestratorConfig) -> Self {
        Self::new(
            storage,
            config.submission_lock_ttl,
            config.submission_poll_interval,
            config.submission_timeout,
        )
    }

    /// Runs `section` while holding the project's lock.
    ///
    /// The lock is released after `section` finishes, whether it succeeded
    /// or not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubmissionBusy`] if the lock is not acquired within
    /// the timeout, a storage error if the lock record is unusable, or the
    /// error returned by `section`.
    pub async fn run<T, F, Fut>(&self, project_id: i64, section: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = DistributedLock::new(
            Arc::clone(&self.storage),
            submission_lock_path(project_id),
        );
        let guard = lock
            .acquire_within(
                self.ttl,
                self.poll_interval,
                self.timeout,
                Some(format!("submit:{project_id}")),
            )
            .await?
            .ok_or(Error::SubmissionBusy { project_id })?;
        tracing::debug!(project_id, holder = guard.holder_id(), "submission guard acquired");

        let result = section().await;

        if let Err(error) = guard.release().await {
            tracing::warn!(project_id, %error, "submission guard release failed; TTL will expire it");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use labrun_core::MemoryBackend;

    use super::*;

    fn guard(storage: &Arc<dyn StorageBackend>, timeout: Duration) -> SubmissionGuard {
        SubmissionGuard::new(
            Arc::clone(storage),
            Duration::from_secs(30),
            Duration::from_millis(5),
            timeout,
        )
    }

    #[tokio::test]
    async fn releases_after_section() -> Result<()> {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let guard = guard(&storage, Duration::from_millis(50));

        let value = guard.run(1, || async { Ok(7) }).await?;
        assert_eq!(value, 7);

        let again = guard.run(1, || async { Ok("second") }).await?;
        assert_eq!(again, "second");
        assert!(storage.head(&submission_lock_path(1)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn releases_after_failed_section() -> Result<()> {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let guard = guard(&storage, Duration::from_millis(50));

        let failed: Result<()> = guard
            .run(1, || async { Err(Error::configuration("boom")) })
            .await;
        assert!(failed.is_err());

        guard.run(1, || async { Ok(()) }).await?;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_holder_makes_second_submission_busy() -> Result<()> {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let holder = DistributedLock::new(Arc::clone(&storage), submission_lock_path(3));
        let held = holder
            .try_acquire(Duration::from_secs(30))
            .await?
            .expect("acquired");

        let err = guard(&storage, Duration::from_millis(30))
            .run(3, || async { Ok(()) })
            .await
            .expect_err("busy");
        assert!(matches!(err, Error::SubmissionBusy { project_id: 3 }));

        // Other projects are unaffected.
        guard(&storage, Duration::from_millis(30))
            .run(4, || async { Ok(()) })
            .await?;

        held.release().await?;
        Ok(())
    }
}
