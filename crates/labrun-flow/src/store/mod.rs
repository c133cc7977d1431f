//! Pluggable persistence for experiment rows.
//!
//! The relational layer that owns the experiment table is external; this
//! module defines the narrow surface the orchestrator needs from it:
//!
//! - **Row locks**: every read-modify-write happens under a lock held for the
//!   duration of one reconciliation step
//! - **Partial updates**: writes are column → value maps, never whole rows
//! - **Validated transitions**: updates go through [`Experiment::apply`]

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::experiment::{Experiment, ExperimentPatch};

/// A locked experiment row. Dropping it releases the lock.
#[async_trait]
pub trait ExperimentRow: Send {
    /// The row as read when the lock was taken, plus any updates since.
    fn experiment(&self) -> &Experiment;

    /// Applies a partial update to the locked row.
    ///
    /// # Errors
    ///
    /// Returns an error if the status transition is invalid or the write fails.
    async fn update(&mut self, patch: &ExperimentPatch) -> Result<()>;
}

/// Outcome of a row lock attempt.
pub enum RowLock {
    /// The lock is held.
    Acquired(Box<dyn ExperimentRow>),
    /// Another step holds the lock.
    Busy,
    /// No such experiment.
    NotFound,
}

impl RowLock {
    /// Returns the row if the lock was acquired.
    #[must_use]
    pub fn into_row(self) -> Option<Box<dyn ExperimentRow>> {
        match self {
            Self::Acquired(row) => Some(row),
            Self::Busy | Self::NotFound => None,
        }
    }
}

impl std::fmt::Debug for RowLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquired(row) => f
                .debug_tuple("Acquired")
                .field(&row.experiment().id)
                .finish(),
            Self::Busy => f.write_str("Busy"),
            Self::NotFound => f.write_str("NotFound"),
        }
    }
}

/// Storage abstraction for experiment rows.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; workers share one store.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Reads an experiment without locking it.
    async fn get(&self, experiment_id: i64) -> Result<Option<Experiment>>;

    /// Locks a row without waiting (`FOR UPDATE NOWAIT`).
    async fn try_lock(&self, experiment_id: i64) -> Result<RowLock>;

    /// Locks a row, waiting for the current holder to finish.
    async fn lock(&self, experiment_id: i64) -> Result<RowLock>;

    /// Counts experiments in the project that currently hold or await an environment.
    async fn count_active_in_project(&self, project_id: i64) -> Result<usize>;
}
