//! Laboratory Client: the façade to a tenant's remote control plane.
//!
//! Each tenant runs its own Laboratory process that owns the actual
//! cloud-provider batch-compute calls. The orchestrator reaches it through
//! [`LaboratoryClient`], obtained per address from a [`LabConnector`].
//!
//! Remote failures are classified at the adapter boundary into [`LabError`].
//! Reconciliation logic only ever asks [`LabError::is_not_found`]; it never
//! inspects provider-specific codes or messages.

pub mod http;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result alias for Laboratory calls.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// A classified Laboratory failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabError {
    /// The resource does not exist or its id is malformed.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of resource (`environment`, `job`, `image`).
        resource: String,
        /// The id that was looked up.
        id: String,
    },

    /// The request did not complete within the request timeout.
    #[error("laboratory request timed out")]
    Timeout,

    /// The Laboratory answered with an error.
    #[error("laboratory returned {code}: {message}")]
    Remote {
        /// Provider error code.
        code: String,
        /// Provider error message.
        message: String,
    },

    /// The Laboratory could not be reached or answered with garbage.
    #[error("laboratory transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },
}

impl LabError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Creates a remote error.
    #[must_use]
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Returns true if the resource is gone (or never existed).
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Parameters for `CreateExperimentEnv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvRequest {
    /// Number of compute nodes.
    pub node_count: u32,
    /// System disk size in GB.
    pub disk_size_gb: u32,
    /// Object storage path mounted on the nodes.
    pub input_path: String,
    /// Machine image id.
    pub image_id: String,
    /// Availability zone.
    pub zone: String,
    /// Instance type.
    pub instance_type: String,
    /// Disk type.
    pub disk_type: String,
}

/// One provisioned node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Private IP address.
    pub ip: String,
    /// CPU cores.
    #[serde(default)]
    pub cpu: u32,
    /// GPU devices.
    #[serde(default)]
    pub gpu: u32,
}

/// Node metrics of an environment, from `QueryExperimentEnv`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvStatus {
    /// Nodes up and running.
    pub running_count: u32,
    /// Nodes the provider failed to create.
    pub creation_failed_count: u32,
    /// Nodes in an abnormal state.
    pub abnormal_count: u32,
    /// Running nodes.
    pub nodes: Vec<NodeInfo>,
}

impl EnvStatus {
    /// Returns true if any node failed or is abnormal.
    #[must_use]
    pub const fn has_failed_nodes(&self) -> bool {
        self.creation_failed_count > 0 || self.abnormal_count > 0
    }
}

/// Parameters for `SubmitExperiment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Job name.
    pub name: String,
    /// Job description.
    pub description: String,
    /// Base64-encoded shell command.
    pub command: String,
    /// Object storage prefix holding topology files and receiving outputs.
    pub cos_path: String,
    /// Environment the job runs in.
    pub env_id: String,
    /// Availability zone.
    pub zone: String,
    /// Job timeout in seconds.
    pub timeout_secs: u64,
}

/// Remote job state, from `QueryExperiment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Accepted, waiting for resources.
    Pending,
    /// Being scheduled onto nodes.
    Starting,
    /// Executing.
    Running,
    /// Finished successfully as far as the provider knows.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
}

impl JobState {
    /// Parses a provider job state string.
    ///
    /// Unknown states map to `Pending` so the job keeps being polled.
    #[must_use]
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "STARTING" => Self::Starting,
            "RUNNING" => Self::Running,
            "SUCCEED" | "SUCCEEDED" => Self::Succeeded,
            "FAILED" | "FAILED_INTERRUPTED" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Returns true while the job has not finished.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Starting | Self::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// Image metadata, from `CvmImage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    /// Image id.
    pub image_id: String,
    /// Image name.
    #[serde(default)]
    pub image_name: String,
    /// Provider account owning the image.
    pub owner_account: String,
}

/// The per-tenant remote control plane.
///
/// Every call carries a bounded request timeout and fails with a classified
/// [`LabError`].
#[async_trait]
pub trait LaboratoryClient: Send + Sync {
    /// Creates a compute environment and returns its id.
    async fn create_experiment_env(&self, request: &EnvRequest) -> LabResult<String>;

    /// Returns node metrics of an environment.
    async fn query_experiment_env(&self, env_id: &str) -> LabResult<EnvStatus>;

    /// Deletes an environment.
    async fn delete_experiment_env(&self, env_id: &str) -> LabResult<()>;

    /// Submits a job and returns its id.
    async fn submit_experiment(&self, request: &JobRequest) -> LabResult<String>;

    /// Returns the state of a job.
    async fn query_experiment(&self, job_id: &str) -> LabResult<JobState>;

    /// Requests termination of a running job.
    async fn terminate_experiment(&self, job_id: &str) -> LabResult<()>;

    /// Deletes a job.
    async fn delete_experiment(&self, job_id: &str) -> LabResult<()>;

    /// Lists zones with capacity.
    async fn available_zone_list(&self) -> LabResult<Vec<String>>;

    /// Looks up an image.
    async fn cvm_image(&self, image_id: &str) -> LabResult<ImageInfo>;

    /// Shares an image with another provider account.
    async fn share_cvm_image(&self, image_id: &str, account: &str) -> LabResult<()>;
}

/// Resolves a tenant's Laboratory address into a client.
pub trait LabConnector: Send + Sync {
    /// Returns a client for the Laboratory at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is unusable.
    fn connect(&self, address: &str) -> LabResult<Arc<dyn LaboratoryClient>>;
}
