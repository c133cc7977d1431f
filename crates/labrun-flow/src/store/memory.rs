//! In-memory experiment store.
//!
//! Each row sits behind its own `tokio::sync::Mutex`, so [`ExperimentStore::try_lock`]
//! behaves like a NOWAIT row lock and [`ExperimentStore::lock`] like a blocking one.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: Rows are not shared across process boundaries

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use super::{ExperimentRow, ExperimentStore, RowLock};
use crate::error::{Error, Result};
use crate::experiment::{Experiment, ExperimentPatch};

type Row = Arc<RowMutex<Experiment>>;
type History = Arc<Mutex<Vec<(i64, ExperimentPatch)>>>;

/// In-memory experiment store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: RwLock<HashMap<i64, Row>>,
    history: History,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("experiment store lock poisoned")
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an experiment row.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert(&self, experiment: Experiment) -> Result<()> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        rows.insert(experiment.id, Arc::new(RowMutex::new(experiment)));
        drop(rows);
        Ok(())
    }

    /// Returns every patch applied to an experiment, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn history(&self, experiment_id: i64) -> Result<Vec<ExperimentPatch>> {
        let history = self.history.lock().map_err(poison_err)?;
        Ok(history
            .iter()
            .filter(|(id, _)| *id == experiment_id)
            .map(|(_, patch)| patch.clone())
            .collect())
    }

    fn row(&self, experiment_id: i64) -> Result<Option<Row>> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(rows.get(&experiment_id).cloned())
    }

    fn all_rows(&self) -> Result<Vec<Row>> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(rows.values().cloned().collect())
    }

    fn locked(&self, guard: OwnedMutexGuard<Experiment>) -> RowLock {
        RowLock::Acquired(Box::new(LockedRow {
            guard,
            history: Arc::clone(&self.history),
        }))
    }
}

struct LockedRow {
    guard: OwnedMutexGuard<Experiment>,
    history: History,
}

#[async_trait]
impl ExperimentRow for LockedRow {
    fn experiment(&self) -> &Experiment {
        &self.guard
    }

    async fn update(&mut self, patch: &ExperimentPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.guard.apply(patch)?;
        self.history
            .lock()
            .map_err(poison_err)?
            .push((self.guard.id, patch.clone()));
        Ok(())
    }
}

#[async_trait]
impl ExperimentStore for InMemoryStore {
    async fn get(&self, experiment_id: i64) -> Result<Option<Experiment>> {
        let Some(row) = self.row(experiment_id)? else {
            return Ok(None);
        };
        let experiment = row.lock().await.clone();
        Ok(Some(experiment))
    }

    async fn try_lock(&self, experiment_id: i64) -> Result<RowLock> {
        let Some(row) = self.row(experiment_id)? else {
            return Ok(RowLock::NotFound);
        };
        match row.try_lock_owned() {
            Ok(guard) => Ok(self.locked(guard)),
            Err(_) => Ok(RowLock::Busy),
        }
    }

    async fn lock(&self, experiment_id: i64) -> Result<RowLock> {
        let Some(row) = self.row(experiment_id)? else {
            return Ok(RowLock::NotFound);
        };
        let guard = row.lock_owned().await;
        Ok(self.locked(guard))
    }

    async fn count_active_in_project(&self, project_id: i64) -> Result<usize> {
        let mut active = 0;
        for row in self.all_rows()? {
            let experiment = row.lock().await;
            if experiment.project_id == project_id && experiment.status.is_active() {
                active += 1;
            }
        }
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentStatus;

    fn experiment(id: i64, project_id: i64, status: ExperimentStatus) -> Experiment {
        Experiment {
            id,
            project_id,
            status,
            ..Experiment::default()
        }
    }

    #[tokio::test]
    async fn try_lock_is_exclusive() -> Result<()> {
        let store = InMemoryStore::new();
        store.insert(experiment(1, 1, ExperimentStatus::CreatingEnv))?;

        let held = store.try_lock(1).await?.into_row().expect("lock");
        assert!(matches!(store.try_lock(1).await?, RowLock::Busy));

        drop(held);
        assert!(matches!(store.try_lock(1).await?, RowLock::Acquired(_)));
        Ok(())
    }

    #[tokio::test]
    async fn missing_row_is_not_found() -> Result<()> {
        let store = InMemoryStore::new();
        assert!(matches!(store.try_lock(404).await?, RowLock::NotFound));
        assert!(store.get(404).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn update_persists_and_records_history() -> Result<()> {
        let store = InMemoryStore::new();
        store.insert(experiment(2, 1, ExperimentStatus::CreatingEnv))?;

        let mut row = store.try_lock(2).await?.into_row().expect("lock");
        row.update(
            &ExperimentPatch::new()
                .with_status(ExperimentStatus::Computing)
                .with_job_id("job-1"),
        )
        .await?;
        assert_eq!(row.experiment().status, ExperimentStatus::Computing);
        drop(row);

        let stored = store.get(2).await?.expect("row");
        assert_eq!(stored.batch_job_id, "job-1");
        assert_eq!(store.history(2)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_transition_leaves_row_untouched() -> Result<()> {
        let store = InMemoryStore::new();
        store.insert(experiment(3, 1, ExperimentStatus::Succeeded))?;

        let mut row = store.try_lock(3).await?.into_row().expect("lock");
        let err = row
            .update(&ExperimentPatch::new().with_status(ExperimentStatus::Computing))
            .await
            .expect_err("terminal");
        assert!(matches!(err, Error::InvalidStatusTransition { .. }));
        drop(row);

        assert_eq!(store.get(3).await?.expect("row").status, ExperimentStatus::Succeeded);
        assert!(store.history(3)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn counts_active_per_project() -> Result<()> {
        let store = InMemoryStore::new();
        store.insert(experiment(1, 7, ExperimentStatus::CreatingEnv))?;
        store.insert(experiment(2, 7, ExperimentStatus::Computing))?;
        store.insert(experiment(3, 7, ExperimentStatus::Failed))?;
        store.insert(experiment(4, 8, ExperimentStatus::Computing))?;

        assert_eq!(store.count_active_in_project(7).await?, 2);
        assert_eq!(store.count_active_in_project(8).await?, 1);
        assert_eq!(store.count_active_in_project(9).await?, 0);
        Ok(())
    }
}
