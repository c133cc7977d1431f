//! Pre-built fixtures and a wired test harness.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use labrun_core::{MemoryBackend, StorageBackend, WritePrecondition};
use labrun_flow::command::experiment_prefix;
use labrun_flow::config::OrchestratorConfig;
use labrun_flow::convergence::{OSZICAR_FILE, SOLVER_LOG_FILE};
use labrun_flow::dispatch::memory::InMemoryTaskQueue;
use labrun_flow::dispatch::{TaskEnvelope, TaskKind, TaskQueue};
use labrun_flow::error::Result;
use labrun_flow::experiment::{Experiment, ExperimentStatus, task_uuid};
use labrun_flow::orchestrator::{Disposition, Orchestrator};
use labrun_flow::store::ExperimentStore;
use labrun_flow::store::memory::InMemoryStore;

use crate::lab::{ScriptedLaboratory, StaticConnector};
use crate::notify::RecordingNotifier;

/// Laboratory address used by fixtures.
pub const TEST_LAB_ADDRESS: &str = "lab.test:8080";

/// Factory for experiments in each lifecycle phase.
pub struct ExperimentFactory;

impl ExperimentFactory {
    /// A 4-node `vasp_std` draft in project 1.
    pub fn draft(id: i64) -> Experiment {
        Experiment {
            id,
            user_id: 100,
            project_id: 1,
            name: format!("relax-{id}"),
            experiment_type: "vasp_std".to_string(),
            status: ExperimentStatus::Draft,
            compute_node_num: 4,
            image_id: "img-vasp".to_string(),
            instance_type: "S5.LARGE8".to_string(),
            disk_type: "CLOUD_SSD".to_string(),
            input_path: format!("cos://inputs/{id}"),
            lab_address: TEST_LAB_ADDRESS.to_string(),
            lab_account: "tenant".to_string(),
            ..Experiment::default()
        }
    }

    /// An experiment waiting for its environment.
    pub fn creating_env(id: i64, env_id: &str) -> Experiment {
        Experiment {
            status: ExperimentStatus::CreatingEnv,
            batch_env_id: env_id.to_string(),
            zone: "zone-a".to_string(),
            start_at: 1_700_000_000,
            ..Self::draft(id)
        }
    }

    /// An experiment whose job is running.
    pub fn computing(id: i64, env_id: &str, job_id: &str) -> Experiment {
        Experiment {
            status: ExperimentStatus::Computing,
            batch_job_id: job_id.to_string(),
            ..Self::creating_env(id, env_id)
        }
    }

    /// A running experiment the user asked to stop.
    pub fn terminating(id: i64, env_id: &str, job_id: &str) -> Experiment {
        Experiment {
            status: ExperimentStatus::Terminating,
            ..Self::computing(id, env_id, job_id)
        }
    }
}

/// Configuration with short lock timings for tests.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        submission_poll_interval: Duration::from_millis(5),
        submission_timeout: Duration::from_millis(100),
        worker_count: 2,
        worker_idle_poll: Duration::from_millis(10),
        ..OrchestratorConfig::default()
    }
}

/// Store, queue, storage, Laboratory and notifier wired into an orchestrator.
pub struct TestHarness {
    /// Experiment rows.
    pub store: Arc<InMemoryStore>,
    /// Task queue.
    pub queue: Arc<InMemoryTaskQueue>,
    /// Object storage.
    pub storage: Arc<MemoryBackend>,
    /// Scripted Laboratory behind every address.
    pub lab: Arc<ScriptedLaboratory>,
    /// Connector handing out `lab`.
    pub connector: Arc<StaticConnector>,
    /// Recording notifier.
    pub notifier: Arc<RecordingNotifier>,
    /// The orchestrator under test.
    pub orchestrator: Arc<Orchestrator>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Harness with [`test_config`] and an accepting notifier.
    pub fn new() -> Self {
        Self::build(test_config(), RecordingNotifier::new())
    }

    /// Harness with a custom configuration and notifier.
    pub fn build(config: OrchestratorConfig, notifier: RecordingNotifier) -> Self {
        let queue = InMemoryTaskQueue::new(config.queue_name.clone());
        Self::build_with_queue(config, notifier, queue)
    }

    /// Harness over a caller-built queue, e.g. one with a capacity limit.
    pub fn build_with_queue(
        config: OrchestratorConfig,
        notifier: RecordingNotifier,
        queue: InMemoryTaskQueue,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(queue);
        let storage = Arc::new(MemoryBackend::new());
        let lab = Arc::new(ScriptedLaboratory::new());
        let connector = Arc::new(StaticConnector::new(Arc::clone(&lab)));
        let notifier = Arc::new(notifier);

        let orchestrator = Orchestrator::new(
            config,
            store.clone(),
            queue.clone(),
            storage.clone(),
            connector.clone(),
            notifier.clone(),
        )
        .expect("valid test configuration");

        Self {
            store,
            queue,
            storage,
            lab,
            connector,
            notifier,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Inserts an experiment row.
    pub fn insert(&self, experiment: Experiment) -> &Self {
        self.store.insert(experiment).expect("insert experiment");
        self
    }

    /// Reads an experiment row.
    pub async fn experiment(&self, id: i64) -> Experiment {
        self.store
            .get(id)
            .await
            .expect("store read")
            .expect("experiment exists")
    }

    /// Enqueues a task of `kind` for an experiment, due now.
    pub async fn schedule(&self, kind: TaskKind, experiment_id: i64) {
        let envelope = self.orchestrator.services().envelope(kind, experiment_id);
        let result = self.queue.enqueue(envelope).await.expect("enqueue");
        assert!(result.is_pending(), "queue rejected task: {result:?}");
    }

    /// Envelopes waiting in the queue, earliest ETA first.
    pub fn pending(&self) -> Vec<TaskEnvelope> {
        self.queue.pending().expect("queue read")
    }

    /// Envelopes waiting for one experiment, earliest ETA first.
    pub fn pending_for(&self, experiment_id: i64) -> Vec<TaskEnvelope> {
        self.queue
            .pending_for(&task_uuid(experiment_id))
            .expect("queue read")
    }

    /// Asserts that an active experiment has a task waiting for it.
    ///
    /// # Panics
    ///
    /// Panics if the experiment is in an active status with nothing queued.
    pub async fn assert_not_orphaned(&self, experiment_id: i64) {
        let experiment = self.experiment(experiment_id).await;
        if experiment.status.is_active() {
            assert!(
                !self.pending_for(experiment_id).is_empty(),
                "experiment {experiment_id} is {} with no task queued",
                experiment.status
            );
        }
    }

    /// Kinds of the waiting envelopes, earliest ETA first.
    pub fn pending_kinds(&self) -> Vec<TaskKind> {
        self.pending().iter().filter_map(TaskEnvelope::kind).collect()
    }

    /// Takes the earliest envelope regardless of its ETA and executes it.
    pub async fn run_next(&self) -> Option<Result<Disposition>> {
        let entry = self.queue.take().expect("queue read")?;
        Some(self.orchestrator.execute(entry.envelope).await)
    }

    /// Runs queued tasks until the queue is empty or `max_steps` ran.
    pub async fn run_until_idle(&self, max_steps: usize) -> Vec<Result<Disposition>> {
        let mut results = Vec::new();
        while results.len() < max_steps {
            let Some(result) = self.run_next().await else {
                break;
            };
            results.push(result);
        }
        results
    }

    /// Writes an object into storage.
    pub async fn put_file(&self, path: &str, content: &str) {
        self.storage
            .put(
                path,
                Bytes::from(content.to_string()),
                WritePrecondition::None,
            )
            .await
            .expect("storage write");
    }

    /// Writes the solver log and `OSZICAR` of an experiment.
    pub async fn write_solver_output(&self, experiment: &Experiment, log: &str, oszicar: &str) {
        let prefix = experiment_prefix(&self.orchestrator.config().storage_prefix, experiment);
        self.put_file(&format!("{prefix}{SOLVER_LOG_FILE}"), log).await;
        self.put_file(&format!("{prefix}{OSZICAR_FILE}"), oszicar)
            .await;
    }

    /// Returns the storage as the trait object the orchestrator sees.
    pub fn storage_backend(&self) -> Arc<dyn StorageBackend> {
        self.storage.clone()
    }
}
