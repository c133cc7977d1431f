//! Task dispatch abstraction for reconciliation tasks.
//!
//! This module provides:
//!
//! - [`TaskEnvelope`]: the queue wire message (name, routing key, UUID, ETA,
//!   retry count, typed named arguments)
//! - [`TaskKind`]: the four reconciliation task kinds
//! - [`TaskQueue`]: trait for enqueueing envelopes to a queue backend
//! - [`TaskSource`]: trait for pulling due envelopes
//! - [`InMemoryTaskQueue`](memory::InMemoryTaskQueue): in-memory queue
//!
//! ## Delivery Semantics
//!
//! - **At-least-once**: a task may run more than once; handlers re-check the
//!   persisted status before acting
//! - **Scoped UUIDs**: every task of an experiment carries `experiment_<id>`;
//!   backends that support it deduplicate pending `(name, uuid)` pairs
//! - **No ordering across tasks**: the row lock and stale-phase checks
//!   compensate

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Argument name carrying the experiment id.
pub const ARG_EXPERIMENT_ID: &str = "experiment_id";
/// Argument name carrying the environment id.
pub const ARG_ENV_ID: &str = "env_id";
/// Argument name carrying the job id.
pub const ARG_JOB_ID: &str = "job_id";
/// Argument name carrying the Laboratory address.
pub const ARG_LAB_ADDRESS: &str = "lab_address";

/// The reconciliation task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Polls environment provisioning.
    EnvMonitor,
    /// Polls job execution.
    ComputeMonitor,
    /// Deletes the remote job and environment, retrying.
    Teardown,
    /// Notifies an operator that teardown gave up.
    NotifyTeardownFailed,
}

impl TaskKind {
    /// All task kinds.
    pub const ALL: [Self; 4] = [
        Self::EnvMonitor,
        Self::ComputeMonitor,
        Self::Teardown,
        Self::NotifyTeardownFailed,
    ];

    /// Returns the registry name of this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EnvMonitor => "experiment.env_monitor",
            Self::ComputeMonitor => "experiment.compute_monitor",
            Self::Teardown => "experiment.teardown",
            Self::NotifyTeardownFailed => "experiment.notify_teardown_failed",
        }
    }

    /// Parses a registry name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Returns a short label for metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::EnvMonitor => "env_monitor",
            Self::ComputeMonitor => "compute_monitor",
            Self::Teardown => "teardown",
            Self::NotifyTeardownFailed => "notify_teardown_failed",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire type of a task argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    /// Signed 64-bit integer.
    Int64,
    /// UTF-8 string.
    String,
}

/// A typed named task argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskArg {
    /// Argument name.
    pub name: String,
    /// Wire type.
    #[serde(rename = "Type")]
    pub arg_type: ArgType,
    /// Value.
    pub value: Value,
}

/// Envelope for a reconciliation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskEnvelope {
    /// Task name, a key into the handler table.
    pub name: String,
    /// Queue name.
    pub routing_key: String,
    /// Experiment-scoped UUID (`experiment_<id>`).
    #[serde(rename = "UUID")]
    pub uuid: String,
    /// Earliest dispatch time.
    #[serde(rename = "ETA")]
    pub eta: DateTime<Utc>,
    /// Number of prior attempts of this logical step.
    #[serde(default)]
    pub retry_count: u32,
    /// Ordered typed arguments.
    #[serde(default)]
    pub args: Vec<TaskArg>,
}

impl TaskEnvelope {
    /// Creates an envelope due now.
    #[must_use]
    pub fn new(kind: TaskKind, routing_key: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: kind.name().to_string(),
            routing_key: routing_key.into(),
            uuid: uuid.into(),
            eta: Utc::now(),
            retry_count: 0,
            args: Vec::new(),
        }
    }

    /// Appends an `int64` argument.
    #[must_use]
    pub fn with_int(mut self, name: impl Into<String>, value: i64) -> Self {
        self.args.push(TaskArg {
            name: name.into(),
            arg_type: ArgType::Int64,
            value: Value::from(value),
        });
        self
    }

    /// Appends a `string` argument.
    #[must_use]
    pub fn with_string(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push(TaskArg {
            name: name.into(),
            arg_type: ArgType::String,
            value: Value::from(value.into()),
        });
        self
    }

    /// Sets the retry counter.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Sets the ETA to `delay` from now.
    #[must_use]
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.eta = eta_after(delay);
        self
    }

    /// Returns the task kind, if the name is known.
    #[must_use]
    pub fn kind(&self) -> Option<TaskKind> {
        TaskKind::from_name(&self.name)
    }

    /// Returns the deduplication key for pending envelopes.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.name, self.uuid)
    }

    /// Returns true if the envelope may run at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eta <= now
    }

    fn arg(&self, name: &str) -> Option<&TaskArg> {
        self.args.iter().find(|arg| arg.name == name)
    }

    fn invalid(&self, argument: &str, message: impl Into<String>) -> Error {
        Error::InvalidTaskArgument {
            task: self.name.clone(),
            argument: argument.to_string(),
            message: message.into(),
        }
    }

    /// Reads a required `int64` argument.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTaskArgument`] if it is missing or not an integer.
    pub fn int_arg(&self, name: &str) -> Result<i64> {
        let arg = self.arg(name).ok_or_else(|| self.invalid(name, "missing"))?;
        if arg.arg_type != ArgType::Int64 {
            return Err(self.invalid(name, "expected int64"));
        }
        arg.value
            .as_i64()
            .ok_or_else(|| self.invalid(name, format!("not an integer: {}", arg.value)))
    }

    /// Reads an optional `string` argument; empty strings read as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTaskArgument`] if present but not a string.
    pub fn string_arg(&self, name: &str) -> Result<Option<String>> {
        let Some(arg) = self.arg(name) else {
            return Ok(None);
        };
        if arg.arg_type != ArgType::String {
            return Err(self.invalid(name, "expected string"));
        }
        let value = arg
            .value
            .as_str()
            .ok_or_else(|| self.invalid(name, format!("not a string: {}", arg.value)))?;
        Ok(Some(value.to_string()).filter(|v| !v.is_empty()))
    }
}

/// Returns the absolute time `delay` from now.
#[must_use]
pub fn eta_after(delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of enqueuing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Task was enqueued successfully.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// An identical `(name, uuid)` envelope is already pending.
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
    /// Queue is at capacity.
    QueueFull,
}

impl EnqueueResult {
    /// Returns true if the task was successfully enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    /// Returns true if a task for the step is pending after this call.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Enqueued { .. } | Self::Deduplicated { .. })
    }

    /// Returns the message ID if enqueued or deduplicated.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => Some(message_id),
            Self::QueueFull => None,
        }
    }
}

/// Task queue abstraction for dispatching envelopes to a queue backend.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from
/// multiple workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues an envelope, visible to workers at its ETA.
    ///
    /// # Returns
    ///
    /// - `EnqueueResult::Enqueued` with message ID on success
    /// - `EnqueueResult::Deduplicated` if the step is already pending
    /// - `EnqueueResult::QueueFull` if queue is at capacity
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<EnqueueResult>;

    /// Enqueues multiple envelopes.
    ///
    /// Default implementation calls `enqueue` for each task.
    async fn enqueue_batch(&self, envelopes: Vec<TaskEnvelope>) -> Result<Vec<EnqueueResult>> {
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            results.push(self.enqueue(envelope).await?);
        }
        Ok(results)
    }

    /// Returns the approximate number of pending tasks.
    async fn queue_depth(&self) -> Result<usize>;

    /// Returns the queue's name.
    fn queue_name(&self) -> &str;
}

/// Source of due envelopes for the worker pool.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Removes and returns the earliest envelope whose ETA is at or before `now`.
    async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<TaskEnvelope>>;
}
