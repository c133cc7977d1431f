//! Error types for the orchestration domain.

use crate::command::CommandError;
use crate::experiment::ExperimentStatus;
use crate::lab::LabError;

/// The result type used throughout labrun-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An experiment was not found.
    #[error("experiment not found: {experiment_id}")]
    ExperimentNotFound {
        /// The experiment ID that was not found.
        experiment_id: i64,
    },

    /// An invalid status transition was attempted.
    #[error("invalid status transition for experiment {experiment_id}: {from} -> {to}")]
    InvalidStatusTransition {
        /// The experiment being updated.
        experiment_id: i64,
        /// The current status.
        from: ExperimentStatus,
        /// The attempted target status.
        to: ExperimentStatus,
    },

    /// The experiment is not in a state that allows the requested action.
    #[error("experiment {experiment_id} is {status}, cannot {action}")]
    InvalidExperimentState {
        /// The experiment ID.
        experiment_id: i64,
        /// Its current status.
        status: ExperimentStatus,
        /// What was attempted.
        action: &'static str,
    },

    /// The experiment row is locked by another reconciliation step.
    #[error("experiment {experiment_id} is locked by another step")]
    ExperimentLocked {
        /// The experiment ID.
        experiment_id: i64,
    },

    /// Another submission holds the project's submission guard.
    #[error("another submission is in progress for project {project_id}, try again later")]
    SubmissionBusy {
        /// The project whose guard could not be acquired.
        project_id: i64,
    },

    /// The provider reports no usable zone.
    #[error("no available zone for instance type {instance_type}")]
    NoAvailableZone {
        /// The requested instance type.
        instance_type: String,
    },

    /// The project already runs the maximum number of environments.
    #[error("project {project_id} already has {active} active environments (limit {limit})")]
    EnvironmentLimitReached {
        /// The project ID.
        project_id: i64,
        /// Environments currently active.
        active: usize,
        /// Configured limit.
        limit: usize,
    },

    /// No handler is registered for a task name.
    #[error("no handler registered for task {name}")]
    UnknownTask {
        /// The task name from the envelope.
        name: String,
    },

    /// A task envelope argument is missing or has the wrong type.
    #[error("invalid argument {argument} for task {task}: {message}")]
    InvalidTaskArgument {
        /// The task name.
        task: String,
        /// The argument name.
        argument: String,
        /// What was wrong.
        message: String,
    },

    /// A remote Laboratory call failed.
    #[error("laboratory error: {0}")]
    Laboratory(#[from] LabError),

    /// Building or launching the job command failed.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Task dispatch failed.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the dispatch failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from labrun-core.
    #[error("core error: {0}")]
    Core(#[from] labrun_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if a remote resource was reported missing.
    #[must_use]
    pub const fn is_remote_not_found(&self) -> bool {
        matches!(self, Self::Laboratory(err) if err.is_not_found())
    }

    /// Returns true if the same delivery may succeed when redelivered.
    ///
    /// Remote, storage and core failures are transient. Argument, state and
    /// queue errors are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Laboratory(_) | Self::Storage { .. } | Self::Core(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn status_transition_error_display() {
        let err = Error::InvalidStatusTransition {
            experiment_id: 9,
            from: ExperimentStatus::Draft,
            to: ExperimentStatus::Computing,
        };
        let msg = err.to_string();
        assert!(msg.contains("draft"));
        assert!(msg.contains("computing"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::storage_with_source("failed to read OSZICAR", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn remote_not_found_is_classified() {
        let err = Error::from(LabError::not_found("environment", "env-1"));
        assert!(err.is_remote_not_found());
        assert!(!Error::from(LabError::Timeout).is_remote_not_found());
        assert!(!Error::storage("x").is_remote_not_found());
    }

    #[test]
    fn transient_errors_are_classified() {
        assert!(Error::from(LabError::Timeout).is_transient());
        assert!(Error::storage("down").is_transient());
        assert!(!Error::dispatch("queue full").is_transient());
        assert!(!Error::UnknownTask { name: "x".into() }.is_transient());
    }
}
