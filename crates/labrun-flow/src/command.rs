//! Command Builder: turns a ready environment into a submitted job.
//!
//! Building is a pure transformation from the node topology, the experiment
//! type and the operator-curated command template into a base64 shell command
//! and four topology files:
//!
//! | File | Content |
//! |------|---------|
//! | `hosts` | `<ip> node<i>` per node |
//! | `hostfile` | `node<i> slots=<cpu>` per node (GPU types omit `slots`) |
//! | `sync_hosts.sh` | appends `hosts` to `/etc/hosts` and trusts every node over SSH |
//! | `mount.sh` | mounts the master's work directory on every other node |
//!
//! Launching writes the files to an experiment-scoped temporary directory,
//! uploads them to `{storage_prefix}/{project_id}/{experiment_id}/`, removes
//! the directory and submits the job. Failures are a [`CommandError`] whose
//! `Display` is persisted verbatim into the experiment's `err_msg`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;

use labrun_core::{StorageBackend, WritePrecondition};

use crate::config::{ExperimentTypeConfig, OrchestratorConfig};
use crate::error::Result;
use crate::experiment::Experiment;
use crate::lab::{JobRequest, LabError, LaboratoryClient, NodeInfo};

/// Directory on the compute nodes where the job inputs are mapped.
pub const WORK_DIR: &str = "/mnt/experiment";

/// Topology file names, in upload order.
pub const TOPOLOGY_FILES: [&str; 4] = ["hosts", "hostfile", "sync_hosts.sh", "mount.sh"];

/// A failure while building or launching the job command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The environment reported no nodes.
    #[error("build command failed: environment has no running nodes")]
    NoNodes,

    /// A node IP has no CPU/GPU entry.
    #[error("build command failed: no resource info for node {ip}")]
    MissingNodeResources {
        /// The uncovered IP.
        ip: String,
    },

    /// The experiment type has no configured executable.
    #[error("build command failed: unknown experiment type '{experiment_type}'")]
    UnknownExperimentType {
        /// The experiment type.
        experiment_type: String,
    },

    /// The stored template is unusable.
    #[error("build command failed: invalid command template: {reason}")]
    InvalidTemplate {
        /// Why the template was rejected.
        reason: String,
    },

    /// Writing the local topology files failed.
    #[error("build command failed: {message}")]
    Io {
        /// What failed.
        message: String,
    },

    /// Uploading the topology files failed.
    #[error("upload topology files failed: {message}")]
    Upload {
        /// What failed.
        message: String,
    },

    /// The Laboratory rejected the job.
    #[error("submit experiment failed: {0}")]
    Submit(LabError),
}

/// CPU and GPU counts of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeResources {
    /// CPU cores.
    pub cpu: u32,
    /// GPU devices.
    pub gpu: u32,
}

/// Node IPs in rank order plus their resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Node IPs; the first is the master.
    pub ips: Vec<String>,
    /// Resources keyed by IP.
    pub resources: BTreeMap<String, NodeResources>,
}

impl Topology {
    /// Builds a topology from queried nodes, keeping their order.
    #[must_use]
    pub fn from_nodes(nodes: &[NodeInfo]) -> Self {
        let mut topology = Self::default();
        for node in nodes {
            topology.ips.push(node.ip.clone());
            topology.resources.insert(
                node.ip.clone(),
                NodeResources {
                    cpu: node.cpu,
                    gpu: node.gpu,
                },
            );
        }
        topology
    }

    fn validate(&self) -> std::result::Result<(), CommandError> {
        if self.ips.is_empty() {
            return Err(CommandError::NoNodes);
        }
        if let Some(ip) = self.ips.iter().find(|ip| !self.resources.contains_key(*ip)) {
            return Err(CommandError::MissingNodeResources { ip: ip.clone() });
        }
        Ok(())
    }

    fn resources_of(&self, ip: &str) -> NodeResources {
        self.resources.get(ip).copied().unwrap_or_default()
    }
}

/// The result of a pure build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    /// Base64-encoded shell command.
    pub command: String,
    /// Topology files as `(name, content)`, in [`TOPOLOGY_FILES`] order.
    pub files: Vec<(&'static str, String)>,
}

impl BuiltCommand {
    /// Decodes the command back to plain text.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is not valid base64 UTF-8.
    pub fn decoded(&self) -> std::result::Result<String, CommandError> {
        let bytes = BASE64
            .decode(&self.command)
            .map_err(|e| CommandError::InvalidTemplate {
                reason: e.to_string(),
            })?;
        String::from_utf8(bytes).map_err(|e| CommandError::InvalidTemplate {
            reason: e.to_string(),
        })
    }
}

fn node_name(rank: usize) -> String {
    format!("node{rank}")
}

fn hosts_file(topology: &Topology) -> String {
    topology
        .ips
        .iter()
        .enumerate()
        .map(|(rank, ip)| format!("{ip} {}\n", node_name(rank)))
        .collect()
}

fn hostfile(topology: &Topology, gpu: bool) -> String {
    topology
        .ips
        .iter()
        .enumerate()
        .map(|(rank, ip)| {
            if gpu {
                format!("{}\n", node_name(rank))
            } else {
                let cpu = topology.resources_of(ip).cpu;
                format!("{} slots={cpu}\n", node_name(rank))
            }
        })
        .collect()
}

fn sync_hosts_script(topology: &Topology) -> String {
    let names: Vec<String> = (0..topology.ips.len()).map(node_name).collect();
    format!(
        "#!/bin/bash\nset -e\ngrep -q '{first}$' /etc/hosts || cat {WORK_DIR}/hosts >> /etc/hosts\n\
mkdir -p ~/.ssh\nfor host in {hosts}; do\n  ssh-keyscan -H \"$host\" >> ~/.ssh/known_hosts 2>/dev/null\ndone\n",
        first = node_name(0),
        hosts = names.join(" "),
    )
}

fn mount_script(topology: &Topology) -> String {
    let master = &topology.ips[0];
    let workers: Vec<String> = (1..topology.ips.len()).map(node_name).collect();
    let mut out = format!(
        "#!/bin/bash\nset -e\ngrep -q '{WORK_DIR}' /etc/exports || echo '{WORK_DIR} *(rw,no_root_squash)' >> /etc/exports\nexportfs -ra\n"
    );
    if !workers.is_empty() {
        out.push_str(&format!(
            "for host in {}; do\n  ssh \"$host\" \"mkdir -p {WORK_DIR} && (mountpoint -q {WORK_DIR} || mount -t nfs {master}:{WORK_DIR} {WORK_DIR})\"\ndone\n",
            workers.join(" "),
        ));
    }
    out
}

/// Builds the command and topology files without side effects.
///
/// `template` is the decoded template. CPU types use the total core count as
/// `{slots}`; GPU types use the total GPU count and enumerate device indices
/// of the widest node into `{gpu_devices}`.
///
/// # Errors
///
/// Returns an error if the topology is incomplete or the template does not
/// reference `{executable}`.
pub fn build_command(
    topology: &Topology,
    experiment_type: &ExperimentTypeConfig,
    template: &str,
) -> std::result::Result<BuiltCommand, CommandError> {
    topology.validate()?;
    if !template.contains("{executable}") {
        return Err(CommandError::InvalidTemplate {
            reason: "template does not reference {executable}".to_string(),
        });
    }

    let resources = topology.ips.iter().map(|ip| topology.resources_of(ip));
    let (slots, gpu_devices) = if experiment_type.gpu {
        let per_node: Vec<u32> = resources.map(|r| r.gpu).collect();
        let total: u32 = per_node.iter().sum();
        let widest = per_node.iter().copied().max().unwrap_or_default();
        let devices: Vec<String> = (0..widest).map(|i| i.to_string()).collect();
        (total, devices.join(","))
    } else {
        (resources.map(|r| r.cpu).sum::<u32>(), String::new())
    };

    let command = template
        .replace("{work_dir}", WORK_DIR)
        .replace("{master_ip}", &topology.ips[0])
        .replace("{slots}", &slots.to_string())
        .replace("{gpu_devices}", &gpu_devices)
        .replace("{executable}", &experiment_type.executable);

    Ok(BuiltCommand {
        command: BASE64.encode(command),
        files: vec![
            (TOPOLOGY_FILES[0], hosts_file(topology)),
            (TOPOLOGY_FILES[1], hostfile(topology, experiment_type.gpu)),
            (TOPOLOGY_FILES[2], sync_hosts_script(topology)),
            (TOPOLOGY_FILES[3], mount_script(topology)),
        ],
    })
}

/// Returns the object storage prefix of an experiment, with a trailing slash.
#[must_use]
pub fn experiment_prefix(storage_prefix: &str, experiment: &Experiment) -> String {
    format!(
        "{}/{}/{}/",
        storage_prefix.trim_end_matches('/'),
        experiment.project_id,
        experiment.id
    )
}

/// Builds, uploads and submits job commands.
pub struct CommandBuilder {
    storage: Arc<dyn StorageBackend>,
    storage_prefix: String,
    template: String,
    experiment_types: BTreeMap<String, ExperimentTypeConfig>,
    job_timeout: Duration,
}

impl std::fmt::Debug for CommandBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuilder")
            .field("storage_prefix", &self.storage_prefix)
            .field("experiment_types", &self.experiment_types)
            .field("job_timeout", &self.job_timeout)
            .finish_non_exhaustive()
    }
}

impl CommandBuilder {
    /// Creates a builder from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the command template cannot be decoded.
    pub fn new(storage: Arc<dyn StorageBackend>, config: &OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            storage,
            storage_prefix: config.storage_prefix.clone(),
            template: config.decoded_command_template()?,
            experiment_types: config.experiment_types.clone(),
            job_timeout: config.job_timeout,
        })
    }

    /// Builds the command for an experiment.
    ///
    /// # Errors
    ///
    /// Returns an error if the experiment type is unknown or the topology is
    /// incomplete.
    pub fn build(
        &self,
        experiment: &Experiment,
        topology: &Topology,
    ) -> std::result::Result<BuiltCommand, CommandError> {
        let kind = self
            .experiment_types
            .get(&experiment.experiment_type)
            .ok_or_else(|| CommandError::UnknownExperimentType {
                experiment_type: experiment.experiment_type.clone(),
            })?;
        build_command(topology, kind, &self.template)
    }

    /// Builds the command, uploads the topology files and submits the job.
    ///
    /// Returns the provider's job id. The temporary directory is removed on
    /// every path.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] describing the first failing step.
    pub async fn launch(
        &self,
        lab: &dyn LaboratoryClient,
        experiment: &Experiment,
        topology: &Topology,
    ) -> std::result::Result<String, CommandError> {
        let built = self.build(experiment, topology)?;
        let prefix = experiment_prefix(&self.storage_prefix, experiment);

        let staging = tempfile::Builder::new()
            .prefix(&format!("labrun-experiment-{}-", experiment.id))
            .tempdir()
            .map_err(|e| CommandError::Io {
                message: format!("create temp dir: {e}"),
            })?;
        self.stage_and_upload(staging.path(), &built, &prefix).await?;
        drop(staging);

        let request = JobRequest {
            name: if experiment.name.is_empty() {
                experiment.task_uuid()
            } else {
                experiment.name.clone()
            },
            description: format!("labrun experiment {}", experiment.id),
            command: built.command,
            cos_path: prefix,
            env_id: experiment.batch_env_id.clone(),
            zone: experiment.zone.clone(),
            timeout_secs: self.job_timeout.as_secs(),
        };
        let job_id = lab
            .submit_experiment(&request)
            .await
            .map_err(CommandError::Submit)?;
        tracing::info!(experiment_id = experiment.id, job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    async fn stage_and_upload(
        &self,
        dir: &Path,
        built: &BuiltCommand,
        prefix: &str,
    ) -> std::result::Result<(), CommandError> {
        for (name, content) in &built.files {
            let local = dir.join(name);
            tokio::fs::write(&local, content)
                .await
                .map_err(|e| CommandError::Io {
                    message: format!("write {name}: {e}"),
                })?;
            let data = tokio::fs::read(&local)
                .await
                .map_err(|e| CommandError::Io {
                    message: format!("read {name}: {e}"),
                })?;
            let path = format!("{prefix}{name}");
            self.storage
                .put(&path, Bytes::from(data), WritePrecondition::None)
                .await
                .map_err(|e| CommandError::Upload {
                    message: format!("{path}: {e}"),
                })?;
            tracing::debug!(path = %path, "uploaded topology file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "cd {work_dir} && mpirun -np {slots} -H {master_ip} -x GPUS={gpu_devices} {executable}";

    fn topology() -> Topology {
        Topology::from_nodes(&[
            NodeInfo {
                ip: "10.0.0.1".into(),
                cpu: 8,
                gpu: 2,
            },
            NodeInfo {
                ip: "10.0.0.2".into(),
                cpu: 16,
                gpu: 4,
            },
        ])
    }

    #[test]
    fn cpu_command_sums_cores() {
        let built = build_command(&topology(), &ExperimentTypeConfig::cpu("/opt/vasp_std"), TEMPLATE)
            .expect("build");
        let command = built.decoded().expect("decode");
        assert_eq!(
            command,
            "cd /mnt/experiment && mpirun -np 24 -H 10.0.0.1 -x GPUS= /opt/vasp_std"
        );
        assert_eq!(built.files[1].1, "node0 slots=8\nnode1 slots=16\n");
    }

    #[test]
    fn gpu_command_enumerates_devices() {
        let built = build_command(&topology(), &ExperimentTypeConfig::gpu("/opt/vasp_gpu"), TEMPLATE)
            .expect("build");
        let command = built.decoded().expect("decode");
        assert!(command.contains("-np 6"));
        assert!(command.contains("GPUS=0,1,2,3"));
        assert_eq!(built.files[1].1, "node0\nnode1\n");
    }

    #[test]
    fn writes_all_topology_files() {
        let built = build_command(&topology(), &ExperimentTypeConfig::cpu("/x"), TEMPLATE)
            .expect("build");
        let names: Vec<_> = built.files.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, TOPOLOGY_FILES);
        assert_eq!(built.files[0].1, "10.0.0.1 node0\n10.0.0.2 node1\n");
        assert!(built.files[2].1.contains("node0 node1"));
        assert!(built.files[3].1.contains("10.0.0.1:/mnt/experiment"));
    }

    #[test]
    fn single_node_mount_script_has_no_workers() {
        let topology = Topology::from_nodes(&[NodeInfo {
            ip: "10.0.0.9".into(),
            cpu: 4,
            gpu: 0,
        }]);
        let built = build_command(&topology, &ExperimentTypeConfig::cpu("/x"), TEMPLATE)
            .expect("build");
        assert!(!built.files[3].1.contains("for host"));
    }

    #[test]
    fn rejects_empty_topology() {
        let err = build_command(&Topology::default(), &ExperimentTypeConfig::cpu("/x"), TEMPLATE)
            .expect_err("no nodes");
        assert_eq!(err, CommandError::NoNodes);
    }

    #[test]
    fn rejects_uncovered_ip() {
        let mut topology = topology();
        topology.ips.push("10.0.0.3".into());
        let err = build_command(&topology, &ExperimentTypeConfig::cpu("/x"), TEMPLATE)
            .expect_err("uncovered");
        assert_eq!(
            err,
            CommandError::MissingNodeResources {
                ip: "10.0.0.3".into()
            }
        );
    }

    #[test]
    fn unknown_experiment_type_is_user_facing() -> Result<()> {
        let storage: Arc<dyn StorageBackend> = Arc::new(labrun_core::MemoryBackend::new());
        let builder = CommandBuilder::new(storage, &OrchestratorConfig::default())?;
        let experiment = Experiment {
            id: 5,
            experiment_type: "castep".into(),
            ..Experiment::default()
        };
        let err = builder.build(&experiment, &topology()).expect_err("unknown");
        assert_eq!(
            err.to_string(),
            "build command failed: unknown experiment type 'castep'"
        );
        Ok(())
    }

    #[test]
    fn prefix_is_project_and_experiment_scoped() {
        let experiment = Experiment {
            id: 42,
            project_id: 7,
            ..Experiment::default()
        };
        assert_eq!(experiment_prefix("experiments/", &experiment), "experiments/7/42/");
    }
}
