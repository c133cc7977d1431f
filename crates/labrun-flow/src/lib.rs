//! # labrun-flow
//!
//! Lifecycle orchestrator for batch compute experiments.
//!
//! An experiment is driven from submission to a terminal status by short,
//! independent reconciliation tasks delivered through a task queue:
//!
//! - **Environment Monitor**: waits for the provisioned nodes, then launches the job
//! - **Compute Monitor**: follows the job and checks the solver's final output
//! - **Teardown**: deletes the job and environment, retrying on failure
//! - **Notify**: tells an operator when teardown gives up
//!
//! ## Guarantees
//!
//! - **Single writer**: every read-modify-write of an experiment happens under its row lock
//! - **Stale deliveries are no-ops**: each task re-checks the persisted status
//! - **Cleanup before terminal**: teardown is attempted before `failed`/`succeeded` is written
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use labrun_core::MemoryBackend;
//! use labrun_flow::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let config = OrchestratorConfig::default();
//! let queue = Arc::new(InMemoryTaskQueue::new(config.queue_name.clone()));
//! let orchestrator = Orchestrator::new(
//!     config,
//!     Arc::new(InMemoryStore::new()),
//!     queue.clone(),
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(HttpLabConnector::new(Duration::from_secs(60))?),
//!     Arc::new(LogNotifier),
//! )?;
//!
//! orchestrator.submit(42).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod config;
pub mod convergence;
pub mod dispatch;
pub mod error;
pub mod experiment;
pub mod guard;
pub mod lab;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod store;
pub mod tasks;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ExperimentTypeConfig, OrchestratorConfig};
    pub use crate::dispatch::memory::InMemoryTaskQueue;
    pub use crate::dispatch::{EnqueueResult, TaskEnvelope, TaskKind, TaskQueue, TaskSource};
    pub use crate::error::{Error, Result};
    pub use crate::experiment::{Experiment, ExperimentPatch, ExperimentStatus};
    pub use crate::lab::http::{HttpLabConnector, HttpLaboratoryClient};
    pub use crate::lab::{LabConnector, LabError, LaboratoryClient};
    pub use crate::metrics::FlowMetrics;
    pub use crate::notify::{LogNotifier, Notifier, TeardownFailureNotice, WebhookNotifier};
    pub use crate::orchestrator::{Disposition, Orchestrator};
    pub use crate::store::memory::InMemoryStore;
    pub use crate::store::{ExperimentRow, ExperimentStore, RowLock};
    pub use crate::worker::WorkerPool;
}

pub use error::{Error, Result};
pub use orchestrator::{Disposition, Orchestrator};
