//! Experiment model and status state machine.
//!
//! An [`Experiment`] is one scientific batch-compute job instance. Its
//! lifecycle fields are written only by the orchestrator, and every write goes
//! through [`Experiment::apply`], which validates the status transition.
//!
//! ## Status Transitions
//!
//! ```text
//! DRAFT ──► CREATING_ENV ──► COMPUTING ──► SUCCEEDED
//!   │            │               │
//!   │            ├──► TERMINATING◄┤
//!   │            │        │       │
//!   └────────────┴────────┴───────┴──► FAILED
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Lifecycle status of an experiment.
///
/// Serialized as the numeric code used by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ExperimentStatus {
    /// Created but never submitted.
    Draft,
    /// Compute environment requested, waiting for nodes.
    CreatingEnv,
    /// Job submitted and executing.
    Computing,
    /// Termination requested by a user; the next poll finalizes it.
    Terminating,
    /// Terminal failure.
    Failed,
    /// Terminal success.
    Succeeded,
}

impl ExperimentStatus {
    /// Returns the persisted numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Draft => 1,
            Self::CreatingEnv => 2,
            Self::Computing => 3,
            Self::Terminating => 4,
            Self::Failed => 5,
            Self::Succeeded => 6,
        }
    }

    /// Parses a persisted numeric code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Draft),
            2 => Some(Self::CreatingEnv),
            3 => Some(Self::Computing),
            4 => Some(Self::Terminating),
            5 => Some(Self::Failed),
            6 => Some(Self::Succeeded),
            _ => None,
        }
    }

    /// Returns true for `failed` and `succeeded`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded)
    }

    /// Returns true while remote resources may exist and a task must be in flight.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::CreatingEnv | Self::Computing | Self::Terminating)
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Writing the current status again is always allowed.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        if self.code() == target.code() {
            return true;
        }
        match self {
            Self::Draft => matches!(target, Self::CreatingEnv | Self::Failed),
            Self::CreatingEnv => {
                matches!(target, Self::Computing | Self::Terminating | Self::Failed)
            }
            Self::Computing => {
                matches!(target, Self::Terminating | Self::Failed | Self::Succeeded)
            }
            Self::Terminating => matches!(target, Self::Failed),
            Self::Failed | Self::Succeeded => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::CreatingEnv => "creating_env",
            Self::Computing => "computing",
            Self::Terminating => "terminating",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        }
    }
}

impl Default for ExperimentStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl From<ExperimentStatus> for i32 {
    fn from(status: ExperimentStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i32> for ExperimentStatus {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown experiment status code {code}"))
    }
}

/// The persisted state of one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Experiment {
    /// Experiment identifier.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Owning project; the submission guard is scoped to it.
    pub project_id: i64,
    /// Parent in the organizational tree (0 for roots).
    pub parent_id: i64,
    /// Display name.
    pub name: String,
    /// Key into the configured experiment types (executable, GPU flag).
    pub experiment_type: String,
    /// Lifecycle status.
    pub status: ExperimentStatus,
    /// Provider environment id; empty until assigned.
    pub batch_env_id: String,
    /// Provider job id; empty until assigned.
    pub batch_job_id: String,
    /// Availability zone chosen at submission.
    pub zone: String,
    /// Number of compute nodes requested.
    pub compute_node_num: u32,
    /// Machine image for the compute nodes.
    pub image_id: String,
    /// Provider instance type.
    pub instance_type: String,
    /// System disk size in GB.
    pub disk_size_gb: u32,
    /// Provider disk type.
    pub disk_type: String,
    /// Object storage path of the job inputs.
    pub input_path: String,
    /// Address of the tenant's Laboratory control plane.
    pub lab_address: String,
    /// Provider account of the tenant, used for image sharing.
    pub lab_account: String,
    /// Unix seconds when the environment was requested (0 = unset).
    pub start_at: i64,
    /// Unix seconds when a terminal status was reached (0 = unset).
    pub done_at: i64,
    /// Human-readable failure reason.
    pub err_msg: String,
    /// Latest solver convergence snapshot, as JSON (empty = none).
    pub oszicar_json: String,
}

impl Default for Experiment {
    fn default() -> Self {
        Self {
            id: 0,
            user_id: 0,
            project_id: 0,
            parent_id: 0,
            name: String::new(),
            experiment_type: String::new(),
            status: ExperimentStatus::Draft,
            batch_env_id: String::new(),
            batch_job_id: String::new(),
            zone: String::new(),
            compute_node_num: 1,
            image_id: String::new(),
            instance_type: String::new(),
            disk_size_gb: 50,
            disk_type: String::new(),
            input_path: String::new(),
            lab_address: String::new(),
            lab_account: String::new(),
            start_at: 0,
            done_at: 0,
            err_msg: String::new(),
            oszicar_json: String::new(),
        }
    }
}

impl Experiment {
    /// Returns the task UUID shared by every reconciliation task of this experiment.
    #[must_use]
    pub fn task_uuid(&self) -> String {
        task_uuid(self.id)
    }

    /// Returns the environment id, if one has been assigned.
    #[must_use]
    pub fn env_id(&self) -> Option<&str> {
        Some(self.batch_env_id.as_str()).filter(|id| !id.is_empty())
    }

    /// Returns the job id, if one has been assigned.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        Some(self.batch_job_id.as_str()).filter(|id| !id.is_empty())
    }

    /// Applies a partial update, validating the status transition.
    ///
    /// A transition into a terminal status without a `done_at` stamps the
    /// current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatusTransition`] if the patch moves the
    /// status along an edge the state machine does not allow.
    pub fn apply(&mut self, patch: &ExperimentPatch) -> Result<()> {
        if let Some(target) = patch.status {
            if !self.status.can_transition_to(target) {
                return Err(Error::InvalidStatusTransition {
                    experiment_id: self.id,
                    from: self.status,
                    to: target,
                });
            }
        }

        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(value) = &patch.batch_env_id {
            self.batch_env_id.clone_from(value);
        }
        if let Some(value) = &patch.batch_job_id {
            self.batch_job_id.clone_from(value);
        }
        if let Some(value) = &patch.zone {
            self.zone.clone_from(value);
        }
        if let Some(value) = patch.start_at {
            self.start_at = value;
        }
        if let Some(value) = patch.done_at {
            self.done_at = value;
        }
        if let Some(value) = &patch.err_msg {
            self.err_msg.clone_from(value);
        }
        if let Some(value) = &patch.oszicar_json {
            self.oszicar_json.clone_from(value);
        }

        if self.status.is_terminal() && self.done_at == 0 {
            self.done_at = Utc::now().timestamp();
        }
        Ok(())
    }
}

/// Returns the task UUID for an experiment id.
#[must_use]
pub fn task_uuid(experiment_id: i64) -> String {
    format!("experiment_{experiment_id}")
}

/// A field-level partial update of the lifecycle columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentPatch {
    /// New status.
    pub status: Option<ExperimentStatus>,
    /// New environment id.
    pub batch_env_id: Option<String>,
    /// New job id.
    pub batch_job_id: Option<String>,
    /// New zone.
    pub zone: Option<String>,
    /// New start timestamp.
    pub start_at: Option<i64>,
    /// New completion timestamp.
    pub done_at: Option<i64>,
    /// New error message.
    pub err_msg: Option<String>,
    /// New convergence snapshot JSON.
    pub oszicar_json: Option<String>,
}

impl ExperimentPatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the patch for a terminal transition.
    #[must_use]
    pub fn terminal(status: ExperimentStatus, done_at: i64, err_msg: Option<String>) -> Self {
        Self {
            status: Some(status),
            done_at: Some(done_at),
            err_msg,
            ..Self::default()
        }
    }

    /// Sets the status.
    #[must_use]
    pub const fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the environment id.
    #[must_use]
    pub fn with_env_id(mut self, env_id: impl Into<String>) -> Self {
        self.batch_env_id = Some(env_id.into());
        self
    }

    /// Sets the job id.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.batch_job_id = Some(job_id.into());
        self
    }

    /// Sets the zone.
    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Sets the start timestamp.
    #[must_use]
    pub const fn with_start_at(mut self, start_at: i64) -> Self {
        self.start_at = Some(start_at);
        self
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_err_msg(mut self, err_msg: impl Into<String>) -> Self {
        self.err_msg = Some(err_msg.into());
        self
    }

    /// Sets the convergence snapshot.
    #[must_use]
    pub fn with_oszicar_json(mut self, json: impl Into<String>) -> Self {
        self.oszicar_json = Some(json.into());
        self
    }

    /// Merges another patch over this one; fields set in `other` win.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.status = other.status.or(self.status);
        self.batch_env_id = other.batch_env_id.or(self.batch_env_id);
        self.batch_job_id = other.batch_job_id.or(self.batch_job_id);
        self.zone = other.zone.or(self.zone);
        self.start_at = other.start_at.or(self.start_at);
        self.done_at = other.done_at.or(self.done_at);
        self.err_msg = other.err_msg.or(self.err_msg);
        self.oszicar_json = other.oszicar_json.or(self.oszicar_json);
        self
    }

    /// Returns true if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns().is_empty()
    }

    /// Returns the update as a column → value map for the persistence layer.
    #[must_use]
    pub fn columns(&self) -> BTreeMap<&'static str, Value> {
        let mut columns = BTreeMap::new();
        if let Some(status) = self.status {
            columns.insert("status", Value::from(status.code()));
        }
        if let Some(value) = &self.batch_env_id {
            columns.insert("batch_env_id", Value::from(value.as_str()));
        }
        if let Some(value) = &self.batch_job_id {
            columns.insert("batch_job_id", Value::from(value.as_str()));
        }
        if let Some(value) = &self.zone {
            columns.insert("zone", Value::from(value.as_str()));
        }
        if let Some(value) = self.start_at {
            columns.insert("start_at", Value::from(value));
        }
        if let Some(value) = self.done_at {
            columns.insert("done_at", Value::from(value));
        }
        if let Some(value) = &self.err_msg {
            columns.insert("err_msg", Value::from(value.as_str()));
        }
        if let Some(value) = &self.oszicar_json {
            columns.insert("oszicar_json", Value::from(value.as_str()));
        }
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment(status: ExperimentStatus) -> Experiment {
        Experiment {
            id: 11,
            status,
            ..Experiment::default()
        }
    }

    #[test]
    fn status_codes_roundtrip() {
        for code in 1..=6 {
            let status = ExperimentStatus::from_code(code).expect("known code");
            assert_eq!(status.code(), code);
        }
        assert!(ExperimentStatus::from_code(0).is_none());
        assert!(ExperimentStatus::try_from(7).is_err());
    }

    #[test]
    fn status_serializes_as_code() {
        let json = serde_json::to_string(&ExperimentStatus::Computing).expect("serialize");
        assert_eq!(json, "3");
        let parsed: ExperimentStatus = serde_json::from_str("5").expect("parse");
        assert_eq!(parsed, ExperimentStatus::Failed);
    }

    #[test]
    fn draft_cannot_jump_to_computing() {
        assert!(!ExperimentStatus::Draft.can_transition_to(ExperimentStatus::Computing));
        let mut exp = experiment(ExperimentStatus::Draft);
        let err = exp
            .apply(&ExperimentPatch::new().with_status(ExperimentStatus::Computing))
            .expect_err("invalid transition");
        assert!(matches!(err, Error::InvalidStatusTransition { .. }));
        assert_eq!(exp.status, ExperimentStatus::Draft);
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [ExperimentStatus::Failed, ExperimentStatus::Succeeded] {
            for target in [
                ExperimentStatus::Draft,
                ExperimentStatus::CreatingEnv,
                ExperimentStatus::Computing,
                ExperimentStatus::Terminating,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
        assert!(!ExperimentStatus::Failed.can_transition_to(ExperimentStatus::Succeeded));
    }

    #[test]
    fn terminating_only_leads_to_failed() {
        assert!(ExperimentStatus::Terminating.can_transition_to(ExperimentStatus::Failed));
        assert!(!ExperimentStatus::Terminating.can_transition_to(ExperimentStatus::Succeeded));
        assert!(!ExperimentStatus::Terminating.can_transition_to(ExperimentStatus::Computing));
    }

    #[test]
    fn terminal_transition_stamps_done_at() {
        let mut exp = experiment(ExperimentStatus::Computing);
        exp.apply(&ExperimentPatch::new().with_status(ExperimentStatus::Failed))
            .expect("valid");
        assert!(exp.done_at > 0);
    }

    #[test]
    fn apply_updates_only_set_fields() {
        let mut exp = experiment(ExperimentStatus::CreatingEnv);
        exp.batch_env_id = "env-1".into();
        exp.apply(
            &ExperimentPatch::new()
                .with_status(ExperimentStatus::Computing)
                .with_job_id("job-9"),
        )
        .expect("valid");
        assert_eq!(exp.batch_env_id, "env-1");
        assert_eq!(exp.batch_job_id, "job-9");
        assert_eq!(exp.job_id(), Some("job-9"));
        assert_eq!(exp.done_at, 0);
    }

    #[test]
    fn patch_columns_are_partial() {
        let patch = ExperimentPatch::terminal(ExperimentStatus::Failed, 1_700_000_000, None)
            .with_err_msg("node creation failed");
        let columns = patch.columns();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns["status"], Value::from(5));
        assert_eq!(columns["done_at"], Value::from(1_700_000_000_i64));
        assert!(ExperimentPatch::new().is_empty());
    }

    #[test]
    fn merge_prefers_later_fields() {
        let merged = ExperimentPatch::new()
            .with_oszicar_json("{}")
            .with_err_msg("first")
            .merge(ExperimentPatch::new().with_err_msg("second"));
        assert_eq!(merged.err_msg.as_deref(), Some("second"));
        assert_eq!(merged.oszicar_json.as_deref(), Some("{}"));
    }

    #[test]
    fn task_uuid_is_scoped_to_experiment() {
        assert_eq!(experiment(ExperimentStatus::Draft).task_uuid(), "experiment_11");
        assert_eq!(task_uuid(3), "experiment_3");
    }
}
