//! Observability infrastructure for labrun.
//!
//! Structured logging with consistent spans. Every reconciliation step runs
//! inside an [`experiment_span`] so log lines from one experiment can be
//! correlated across worker processes.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name, falling back to [`LogFormat::Pretty`].
    #[must_use]
    pub fn from_name(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `labrun_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one reconciliation step of an experiment.
///
/// # Example
///
/// ```rust
/// use labrun_core::observability::experiment_span;
///
/// let span = experiment_span("env_monitor", 42, "experiment_42");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn experiment_span(operation: &str, experiment_id: i64, task_uuid: &str) -> Span {
    tracing::info_span!(
        "experiment",
        op = operation,
        experiment_id = experiment_id,
        task_uuid = task_uuid,
    )
}

/// Creates a span for a project-scoped operation such as submission.
#[must_use]
pub fn project_span(operation: &str, project_id: i64) -> Span {
    tracing::info_span!("project", op = operation, project_id = project_id)
}
