//! Scripted Laboratory fake with call recording.
//!
//! Each remote operation has a queue of scripted results consumed in order.
//! Once a queue is empty the operation falls back to a default: the sticky
//! value set with `set_*`, or a benign success.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use labrun_flow::lab::{
    EnvRequest, EnvStatus, ImageInfo, JobRequest, JobState, LabConnector, LabError, LabResult,
    LaboratoryClient, NodeInfo,
};

/// A recorded Laboratory call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabCall {
    /// `CreateExperimentEnv`.
    CreateEnv(EnvRequest),
    /// `QueryExperimentEnv`.
    QueryEnv(String),
    /// `DeleteExperimentEnv`.
    DeleteEnv(String),
    /// `SubmitExperiment`.
    Submit(JobRequest),
    /// `QueryExperiment`.
    QueryJob(String),
    /// `TerminateExperiment`.
    Terminate(String),
    /// `DeleteExperiment`.
    DeleteJob(String),
    /// `AvailableZoneList`.
    ZoneList,
    /// `CvmImage`.
    CvmImage(String),
    /// `ShareCvmImage`.
    ShareImage {
        /// Image shared.
        image_id: String,
        /// Account it was shared with.
        account: String,
    },
}

#[derive(Debug)]
struct Script {
    create_env: VecDeque<LabResult<String>>,
    query_env: VecDeque<LabResult<EnvStatus>>,
    delete_env: VecDeque<LabResult<()>>,
    submit: VecDeque<LabResult<String>>,
    query_job: VecDeque<LabResult<JobState>>,
    terminate: VecDeque<LabResult<()>>,
    delete_job: VecDeque<LabResult<()>>,
    share_image: VecDeque<LabResult<()>>,
    env_status: EnvStatus,
    job_state: JobState,
    zones: Vec<String>,
    image: ImageInfo,
    create_env_delay: Duration,
    calls: Vec<LabCall>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            create_env: VecDeque::new(),
            query_env: VecDeque::new(),
            delete_env: VecDeque::new(),
            submit: VecDeque::new(),
            query_job: VecDeque::new(),
            terminate: VecDeque::new(),
            delete_job: VecDeque::new(),
            share_image: VecDeque::new(),
            env_status: EnvStatus::default(),
            job_state: JobState::Running,
            zones: vec!["zone-a".to_string()],
            image: ImageInfo {
                image_id: "img-vasp".to_string(),
                image_name: "vasp".to_string(),
                owner_account: "owner".to_string(),
            },
            create_env_delay: Duration::ZERO,
            calls: Vec::new(),
        }
    }
}

/// In-memory Laboratory with per-call scripted responses.
#[derive(Debug, Default)]
pub struct ScriptedLaboratory {
    script: Mutex<Script>,
}

impl ScriptedLaboratory {
    /// Creates a Laboratory where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut script = self.script.lock().expect("lab script lock");
        f(&mut script)
    }

    /// Queues the next `CreateExperimentEnv` result.
    pub fn on_create_env(&self, result: LabResult<String>) -> &Self {
        self.with_script(|s| s.create_env.push_back(result));
        self
    }

    /// Queues the next `QueryExperimentEnv` result.
    pub fn on_query_env(&self, result: LabResult<EnvStatus>) -> &Self {
        self.with_script(|s| s.query_env.push_back(result));
        self
    }

    /// Queues the next `DeleteExperimentEnv` result.
    pub fn on_delete_env(&self, result: LabResult<()>) -> &Self {
        self.with_script(|s| s.delete_env.push_back(result));
        self
    }

    /// Queues the next `SubmitExperiment` result.
    pub fn on_submit(&self, result: LabResult<String>) -> &Self {
        self.with_script(|s| s.submit.push_back(result));
        self
    }

    /// Queues the next `QueryExperiment` result.
    pub fn on_query_job(&self, result: LabResult<JobState>) -> &Self {
        self.with_script(|s| s.query_job.push_back(result));
        self
    }

    /// Queues the next `TerminateExperiment` result.
    pub fn on_terminate(&self, result: LabResult<()>) -> &Self {
        self.with_script(|s| s.terminate.push_back(result));
        self
    }

    /// Queues the next `DeleteExperiment` result.
    pub fn on_delete_job(&self, result: LabResult<()>) -> &Self {
        self.with_script(|s| s.delete_job.push_back(result));
        self
    }

    /// Queues the next `ShareCvmImage` result.
    pub fn on_share_image(&self, result: LabResult<()>) -> &Self {
        self.with_script(|s| s.share_image.push_back(result));
        self
    }

    /// Makes every `CreateExperimentEnv` call take `delay` before answering.
    pub fn set_create_env_delay(&self, delay: Duration) -> &Self {
        self.with_script(|s| s.create_env_delay = delay);
        self
    }

    /// Sets the environment status returned once the script runs out.
    pub fn set_env_status(&self, status: EnvStatus) -> &Self {
        self.with_script(|s| s.env_status = status);
        self
    }

    /// Sets the job state returned once the script runs out.
    pub fn set_job_state(&self, state: JobState) -> &Self {
        self.with_script(|s| s.job_state = state);
        self
    }

    /// Sets the zones offered by `AvailableZoneList`.
    pub fn set_zones(&self, zones: &[&str]) -> &Self {
        self.with_script(|s| s.zones = zones.iter().map(|z| (*z).to_string()).collect());
        self
    }

    /// Sets the image returned by `CvmImage`.
    pub fn set_image(&self, image: ImageInfo) -> &Self {
        self.with_script(|s| s.image = image);
        self
    }

    /// Returns every call made so far, oldest first.
    pub fn calls(&self) -> Vec<LabCall> {
        self.with_script(|s| s.calls.clone())
    }

    /// Counts calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&LabCall) -> bool) -> usize {
        self.with_script(|s| s.calls.iter().filter(|c| predicate(c)).count())
    }

    /// Number of `SubmitExperiment` calls.
    pub fn submit_count(&self) -> usize {
        self.count(|c| matches!(c, LabCall::Submit(_)))
    }

    /// Number of `CreateExperimentEnv` calls.
    pub fn create_env_count(&self) -> usize {
        self.count(|c| matches!(c, LabCall::CreateEnv(_)))
    }

    /// Number of `DeleteExperimentEnv` calls.
    pub fn delete_env_count(&self) -> usize {
        self.count(|c| matches!(c, LabCall::DeleteEnv(_)))
    }

    /// Environment ids passed to `DeleteExperimentEnv`, in call order.
    pub fn deleted_envs(&self) -> Vec<String> {
        self.with_script(|s| {
            s.calls
                .iter()
                .filter_map(|call| match call {
                    LabCall::DeleteEnv(env_id) => Some(env_id.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    /// Number of `DeleteExperiment` calls.
    pub fn delete_job_count(&self) -> usize {
        self.count(|c| matches!(c, LabCall::DeleteJob(_)))
    }

    /// Number of `TerminateExperiment` calls.
    pub fn terminate_count(&self) -> usize {
        self.count(|c| matches!(c, LabCall::Terminate(_)))
    }

    /// Returns the submitted job requests.
    pub fn submitted_jobs(&self) -> Vec<JobRequest> {
        self.with_script(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    LabCall::Submit(request) => Some(request.clone()),
                    _ => None,
                })
                .collect()
        })
    }
}

#[async_trait]
impl LaboratoryClient for ScriptedLaboratory {
    async fn create_experiment_env(&self, request: &EnvRequest) -> LabResult<String> {
        let delay = self.with_script(|s| s.create_env_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with_script(|s| {
            s.calls.push(LabCall::CreateEnv(request.clone()));
            let n = s.calls.len();
            s.create_env.pop_front().unwrap_or_else(|| Ok(format!("env-{n}")))
        })
    }

    async fn query_experiment_env(&self, env_id: &str) -> LabResult<EnvStatus> {
        self.with_script(|s| {
            s.calls.push(LabCall::QueryEnv(env_id.to_string()));
            s.query_env
                .pop_front()
                .unwrap_or_else(|| Ok(s.env_status.clone()))
        })
    }

    async fn delete_experiment_env(&self, env_id: &str) -> LabResult<()> {
        self.with_script(|s| {
            s.calls.push(LabCall::DeleteEnv(env_id.to_string()));
            s.delete_env.pop_front().unwrap_or(Ok(()))
        })
    }

    async fn submit_experiment(&self, request: &JobRequest) -> LabResult<String> {
        self.with_script(|s| {
            s.calls.push(LabCall::Submit(request.clone()));
            let n = s.calls.len();
            s.submit.pop_front().unwrap_or_else(|| Ok(format!("job-{n}")))
        })
    }

    async fn query_experiment(&self, job_id: &str) -> LabResult<JobState> {
        self.with_script(|s| {
            s.calls.push(LabCall::QueryJob(job_id.to_string()));
            s.query_job.pop_front().unwrap_or(Ok(s.job_state))
        })
    }

    async fn terminate_experiment(&self, job_id: &str) -> LabResult<()> {
        self.with_script(|s| {
            s.calls.push(LabCall::Terminate(job_id.to_string()));
            s.terminate.pop_front().unwrap_or(Ok(()))
        })
    }

    async fn delete_experiment(&self, job_id: &str) -> LabResult<()> {
        self.with_script(|s| {
            s.calls.push(LabCall::DeleteJob(job_id.to_string()));
            s.delete_job.pop_front().unwrap_or(Ok(()))
        })
    }

    async fn available_zone_list(&self) -> LabResult<Vec<String>> {
        self.with_script(|s| {
            s.calls.push(LabCall::ZoneList);
            Ok(s.zones.clone())
        })
    }

    async fn cvm_image(&self, image_id: &str) -> LabResult<ImageInfo> {
        self.with_script(|s| {
            s.calls.push(LabCall::CvmImage(image_id.to_string()));
            Ok(s.image.clone())
        })
    }

    async fn share_cvm_image(&self, image_id: &str, account: &str) -> LabResult<()> {
        self.with_script(|s| {
            s.calls.push(LabCall::ShareImage {
                image_id: image_id.to_string(),
                account: account.to_string(),
            });
            s.share_image.pop_front().unwrap_or(Ok(()))
        })
    }
}

/// Connector that hands out the same Laboratory for every address.
#[derive(Debug)]
pub struct StaticConnector {
    lab: Arc<ScriptedLaboratory>,
    addresses: Mutex<Vec<String>>,
}

impl StaticConnector {
    /// Wraps a scripted Laboratory.
    pub fn new(lab: Arc<ScriptedLaboratory>) -> Self {
        Self {
            lab,
            addresses: Mutex::new(Vec::new()),
        }
    }

    /// Returns the addresses connected to, oldest first.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.lock().expect("addresses lock").clone()
    }
}

impl LabConnector for StaticConnector {
    fn connect(&self, address: &str) -> LabResult<Arc<dyn LaboratoryClient>> {
        if address.is_empty() {
            return Err(LabError::transport("empty laboratory address"));
        }
        self.addresses
            .lock()
            .expect("addresses lock")
            .push(address.to_string());
        Ok(Arc::clone(&self.lab) as Arc<dyn LaboratoryClient>)
    }
}

/// Builds an environment status with `running` healthy nodes.
pub fn running_env(running: u32) -> EnvStatus {
    EnvStatus {
        running_count: running,
        creation_failed_count: 0,
        abnormal_count: 0,
        nodes: (0..running)
            .map(|i| NodeInfo {
                ip: format!("10.0.0.{}", i + 1),
                cpu: 8,
                gpu: 0,
            })
            .collect(),
    }
}

/// Builds an environment status with failed nodes.
pub fn failed_env(running: u32, creation_failed: u32) -> EnvStatus {
    EnvStatus {
        creation_failed_count: creation_failed,
        ..running_env(running)
    }
}
