//! Distributed lock backed by object storage.
//!
//! The lock is a small JSON record at a well-known path:
//!
//! 1. Acquisition writes the record with a `DoesNotExist` precondition, so only
//!    one writer can succeed
//! 2. If a record exists and has expired, it is taken over with a version CAS
//! 3. Release expires our own record via version CAS and then deletes it, so
//!    a holder that took over after expiry is never disturbed
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = DistributedLock::new(storage.clone(), "locks/projects/7/submission.lock");
//!
//! let guard = lock
//!     .acquire_within(Duration::from_secs(30), Duration::from_millis(200), Duration::from_secs(10))
//!     .await?
//!     .ok_or(...)?;
//!
//! // critical section
//!
//! guard.release().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default lock TTL (30 seconds).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique lock holder ID.
    pub holder_id: String,

    /// When the lock expires.
    pub expires_at: DateTime<Utc>,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Optional description of the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Creates a new lock info with the given holder ID and TTL.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            acquired_at: now,
            operation: None,
        }
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Internal {
                message: format!("serialize lock: {e}"),
            })
    }
}

/// A distributed lock backed by object storage.
pub struct DistributedLock<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
}

impl<S: StorageBackend + ?Sized> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> DistributedLock<S> {
    /// Creates a new distributed lock.
    ///
    /// Each lock instance gets a unique holder ID.
    #[must_use]
    pub fn new(storage: Arc<S>, lock_path: impl Into<String>) -> Self {
        Self {
            storage,
            lock_path: lock_path.into(),
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Returns the holder ID for this lock instance.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the storage path of the lock record.
    #[must_use]
    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    /// Polls for the lock at a fixed interval until `timeout` elapses.
    ///
    /// Returns `Ok(None)` when the lock is still held by someone else at the
    /// deadline. At least one attempt is always made.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record cannot be read or written.
    pub async fn acquire_within(
        &self,
        ttl: Duration,
        poll_interval: Duration,
        timeout: Duration,
        operation: Option<String>,
    ) -> Result<Option<LockGuard<S>>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(guard) = self.try_acquire_with_operation(ttl, operation.clone()).await? {
                return Ok(Some(guard));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Attempts to acquire the lock once.
    ///
    /// Returns `Ok(None)` if another holder has a live lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record cannot be read or written.
    pub async fn try_acquire(&self, ttl: Duration) -> Result<Option<LockGuard<S>>> {
        self.try_acquire_with_operation(ttl, None).await
    }

    async fn try_acquire_with_operation(
        &self,
        ttl: Duration,
        operation: Option<String>,
    ) -> Result<Option<LockGuard<S>>> {
        let mut lock_info = LockInfo::new(&self.holder_id, ttl);
        lock_info.operation.clone_from(&operation);

        if let WriteResult::Success { version } = self
            .storage
            .put(
                &self.lock_path,
                lock_info.to_bytes()?,
                WritePrecondition::DoesNotExist,
            )
            .await?
        {
            return Ok(Some(self.guard(version)));
        }

        // Version first, then contents: the expiry decision is bound to the
        // version used for the takeover CAS.
        let Some(meta) = self.storage.head(&self.lock_path).await? else {
            return Ok(None);
        };

        match self.read_lock().await? {
            Some(info) if info.is_expired() => {
                let mut takeover = LockInfo::new(&self.holder_id, ttl);
                takeover.operation = operation;

                match self
                    .storage
                    .put(
                        &self.lock_path,
                        takeover.to_bytes()?,
                        WritePrecondition::MatchesVersion(meta.version),
                    )
                    .await?
                {
                    WriteResult::Success { version } => Ok(Some(self.guard(version))),
                    WriteResult::PreconditionFailed { .. } => Ok(None),
                }
            }
            Some(info) => {
                tracing::debug!(
                    lock_path = %self.lock_path,
                    holder = %info.holder_id,
                    "lock held by another holder"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn guard(&self, version: String) -> LockGuard<S> {
        LockGuard {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
            version,
            released: false,
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        read_lock_info(self.storage.as_ref(), &self.lock_path).await
    }

    /// Checks if the lock is currently held (regardless of holder).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock()
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Reads the current lock info without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn read_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }
}

async fn read_lock_info<S: StorageBackend + ?Sized>(
    storage: &S,
    path: &str,
) -> Result<Option<LockInfo>> {
    match storage.get(path).await {
        Ok(data) => {
            let info: LockInfo = serde_json::from_slice(&data).map_err(|e| Error::Internal {
                message: format!("parse lock: {e}"),
            })?;
            Ok(Some(info))
        }
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// RAII guard for a held lock.
///
/// Dropping the guard releases the lock on a best-effort basis; call
/// [`LockGuard::release`] to observe release errors.
pub struct LockGuard<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
    version: String,
    released: bool,
}

impl<S: StorageBackend + ?Sized> std::fmt::Debug for LockGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_path", &self.lock_path)
            .field("holder_id", &self.holder_id)
            .field("version", &self.version)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend + ?Sized> LockGuard<S> {
    /// Returns the holder ID for this lock.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the version at which the lock was acquired.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Explicitly releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be rewritten.
    pub async fn release(mut self) -> Result<()> {
        let result = release_record(
            self.storage.as_ref(),
            &self.lock_path,
            &self.holder_id,
            &self.version,
        )
        .await;
        self.released = true;
        result
    }
}

/// Expires our own record via version CAS, then deletes it.
///
/// The object is only deleted while it still carries the version of the
/// expired write, so a holder that took over in between keeps its record.
async fn release_record<S: StorageBackend + ?Sized>(
    storage: &S,
    path: &str,
    holder_id: &str,
    version: &str,
) -> Result<()> {
    let Some(info) = read_lock_info(storage, path).await? else {
        return Ok(());
    };
    if info.holder_id != holder_id {
        return Ok(());
    }

    let expired = LockInfo {
        holder_id: holder_id.to_string(),
        expires_at: Utc::now() - chrono::Duration::seconds(1),
        acquired_at: info.acquired_at,
        operation: None,
    };

    let expired_version = match storage
        .put(
            path,
            expired.to_bytes()?,
            WritePrecondition::MatchesVersion(version.to_string()),
        )
        .await?
    {
        WriteResult::Success { version } => version,
        // Someone took over after expiry; leave their record alone.
        WriteResult::PreconditionFailed { .. } => return Ok(()),
    };

    match storage.head(path).await? {
        Some(meta) if meta.version == expired_version => storage.delete(path).await,
        _ => Ok(()),
    }
}

impl<S: StorageBackend + ?Sized> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Outside a runtime the TTL cleans up.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let storage = Arc::clone(&self.storage);
        let path = self.lock_path.clone();
        let holder = self.holder_id.clone();
        let version = self.version.clone();

        handle.spawn(async move {
            if let Err(error) = release_record(storage.as_ref(), &path, &holder, &version).await {
                tracing::warn!(lock_path = %path, %error, "background lock release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn lock(storage: &Arc<MemoryBackend>) -> DistributedLock<MemoryBackend> {
        DistributedLock::new(Arc::clone(storage), "locks/projects/7/submission.lock")
    }

    #[tokio::test]
    async fn acquire_and_release() -> Result<()> {
        let storage = Arc::new(MemoryBackend::new());
        let first = lock(&storage);

        let guard = first.try_acquire(DEFAULT_LOCK_TTL).await?.expect("acquired");
        assert!(first.is_locked().await?);

        guard.release().await?;
        assert!(!first.is_locked().await?);
        Ok(())
    }

    #[tokio::test]
    async fn release_deletes_the_record() -> Result<()> {
        let storage = Arc::new(MemoryBackend::new());
        let first = lock(&storage);

        let guard = first.try_acquire(DEFAULT_LOCK_TTL).await?.expect("acquired");
        guard.release().await?;

        assert!(storage.head(first.lock_path()).await?.is_none());
        assert!(first.read_lock_info().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn second_holder_is_refused_while_held() -> Result<()> {
        let storage = Arc::new(MemoryBackend::new());
        let first = lock(&storage);
        let second = lock(&storage);

        let guard = first.try_acquire(DEFAULT_LOCK_TTL).await?.expect("acquired");
        assert!(second.try_acquire(DEFAULT_LOCK_TTL).await?.is_none());

        let info = second.read_lock_info().await?.expect("record");
        assert_eq!(info.holder_id, first.holder_id());

        guard.release().await?;
        let reacquired = second.try_acquire(DEFAULT_LOCK_TTL).await?;
        assert!(reacquired.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() -> Result<()> {
        let storage = Arc::new(MemoryBackend::new());
        let first = lock(&storage);
        let second = lock(&storage);

        let stale = first
            .try_acquire(Duration::from_millis(1))
            .await?
            .expect("acquired");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let taken = second.try_acquire(DEFAULT_LOCK_TTL).await?.expect("takeover");

        // The stale holder's release must not clobber the new holder.
        stale.release().await?;
        let info = second.read_lock_info().await?.expect("record");
        assert_eq!(info.holder_id, second.holder_id());
        assert!(!info.is_expired());

        taken.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn acquire_within_times_out() -> Result<()> {
        let storage = Arc::new(MemoryBackend::new());
        let first = lock(&storage);
        let second = lock(&storage);

        let _guard = first.try_acquire(DEFAULT_LOCK_TTL).await?.expect("acquired");

        let started = std::time::Instant::now();
        let outcome = second
            .acquire_within(
                DEFAULT_LOCK_TTL,
                Duration::from_millis(5),
                Duration::from_millis(30),
                Some("submit".into()),
            )
            .await?;
        assert!(outcome.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
        Ok(())
    }

    #[tokio::test]
    async fn acquire_within_succeeds_after_release() -> Result<()> {
        let storage = Arc::new(MemoryBackend::new());
        let first = lock(&storage);
        let second = lock(&storage);

        let guard = first.try_acquire(DEFAULT_LOCK_TTL).await?.expect("acquired");
        let waiter = tokio::spawn(async move {
            second
                .acquire_within(
                    DEFAULT_LOCK_TTL,
                    Duration::from_millis(5),
                    Duration::from_secs(2),
                    None,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await?;

        let acquired = waiter.await.expect("join")?;
        assert!(acquired.is_some());
        Ok(())
    }
}
