//! Shared test utilities for labrun integration tests.
//!
//! This crate provides:
//! - [`ScriptedLaboratory`]: Laboratory fake with scripted responses and call recording
//! - [`RecordingNotifier`]: operator notifier with scripted delivery results
//! - [`TestHarness`]: store, queue, storage and fakes wired into an orchestrator
//! - Experiment factories and assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use labrun_test_utils::{ExperimentFactory, TestHarness, running_env};
//!
//! #[tokio::test]
//! async fn launches_job() {
//!     let harness = TestHarness::new();
//!     harness.insert(ExperimentFactory::creating_env(1, "env-1"));
//!     harness.lab.on_query_env(Ok(running_env(4)));
//!     harness.schedule(TaskKind::EnvMonitor, 1).await;
//!     harness.run_next().await;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod lab;
pub mod notify;

pub use assertions::*;
pub use fixtures::*;
pub use lab::*;
pub use notify::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("labrun_flow=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
