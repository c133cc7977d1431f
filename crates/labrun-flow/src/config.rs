//! Orchestrator configuration.
//!
//! [`OrchestratorConfig`] is built once at startup and passed to the
//! [`Orchestrator`](crate::orchestrator::Orchestrator) constructor. It can be
//! deserialized (every field has a default) or read from `LABRUN_*`
//! environment variables with [`OrchestratorConfig::from_env`].
//!
//! Durations are written as `<n><unit>` with units `ms`, `s`, `m`, `h`
//! (`"30s"`, `"200ms"`, `"72h"`); a bare integer means seconds.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Command template used when none is configured.
///
/// Placeholders: `{work_dir}`, `{master_ip}`, `{slots}`, `{executable}`,
/// `{gpu_devices}`.
pub const DEFAULT_COMMAND_TEMPLATE: &str = "cd {work_dir} && bash sync_hosts.sh && bash mount.sh \
&& CUDA_VISIBLE_DEVICES={gpu_devices} mpirun --allow-run-as-root -np {slots} \
--hostfile hostfile -x MASTER_ADDR={master_ip} {executable} > vasp.log 2>&1";

/// Convergence pattern used when none is configured.
pub const DEFAULT_CONVERGENCE_PATTERN: &str = r"reached required accuracy";

/// Per-experiment-type launch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentTypeConfig {
    /// Absolute path of the solver executable on the compute nodes.
    pub executable: String,
    /// Whether nodes are weighted by GPU instead of CPU.
    #[serde(default)]
    pub gpu: bool,
}

impl ExperimentTypeConfig {
    /// Creates a CPU experiment type.
    #[must_use]
    pub fn cpu(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            gpu: false,
        }
    }

    /// Creates a GPU experiment type.
    #[must_use]
    pub fn gpu(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            gpu: true,
        }
    }
}

/// Configuration for the orchestrator, its tasks and its workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Routing key of every reconciliation task.
    pub queue_name: String,
    /// Environment Monitor poll interval while provisioning.
    #[serde(with = "duration_str")]
    pub env_poll_interval: Duration,
    /// Delay before the first Environment Monitor run after submission.
    #[serde(with = "duration_str")]
    pub env_monitor_initial_delay: Duration,
    /// Compute Monitor poll interval while the job runs.
    #[serde(with = "duration_str")]
    pub compute_poll_interval: Duration,
    /// Delay before the first Compute Monitor run after job submission.
    #[serde(with = "duration_str")]
    pub compute_monitor_initial_delay: Duration,
    /// Delay before redelivering a step that failed transiently.
    #[serde(with = "duration_str")]
    pub redelivery_delay: Duration,
    /// Consecutive failed or panicked deliveries of a monitor before the
    /// experiment is failed and torn down.
    pub max_step_failures: u32,
    /// Delay between teardown attempts.
    #[serde(with = "duration_str")]
    pub teardown_retry_delay: Duration,
    /// Number of teardown re-enqueues before an operator is notified.
    pub teardown_max_retries: u32,
    /// Delay between notification attempts.
    #[serde(with = "duration_str")]
    pub notify_retry_delay: Duration,
    /// Total notification attempts.
    pub notify_max_attempts: u32,
    /// Per-request Laboratory timeout.
    #[serde(with = "duration_str")]
    pub lab_request_timeout: Duration,
    /// Remote job timeout.
    #[serde(with = "duration_str")]
    pub job_timeout: Duration,
    /// TTL of the submission guard lease.
    #[serde(with = "duration_str")]
    pub submission_lock_ttl: Duration,
    /// Poll interval while waiting for the submission guard.
    #[serde(with = "duration_str")]
    pub submission_poll_interval: Duration,
    /// How long a submission waits for the guard.
    #[serde(with = "duration_str")]
    pub submission_timeout: Duration,
    /// Active environments allowed per project.
    pub max_active_environments_per_project: usize,
    /// Zones tried first, in order, when available.
    pub preferred_zones: Vec<String>,
    /// Object storage prefix for per-experiment files.
    pub storage_prefix: String,
    /// Base64-encoded command template.
    pub command_template: String,
    /// Launch settings keyed by experiment type.
    pub experiment_types: BTreeMap<String, ExperimentTypeConfig>,
    /// Regex the last solver log line must match for a job to count as converged.
    pub convergence_pattern: String,
    /// Number of worker executors.
    pub worker_count: usize,
    /// Worker sleep when no task is due.
    #[serde(with = "duration_str")]
    pub worker_idle_poll: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_name: "labrun_tasks".to_string(),
            env_poll_interval: Duration::from_secs(30),
            env_monitor_initial_delay: Duration::from_secs(30),
            compute_poll_interval: Duration::from_secs(60),
            compute_monitor_initial_delay: Duration::from_secs(60),
            redelivery_delay: Duration::from_secs(30),
            max_step_failures: 3,
            teardown_retry_delay: Duration::from_secs(600),
            teardown_max_retries: 6,
            notify_retry_delay: Duration::from_secs(30),
            notify_max_attempts: 3,
            lab_request_timeout: Duration::from_secs(60),
            job_timeout: Duration::from_secs(72 * 3600),
            submission_lock_ttl: Duration::from_secs(30),
            submission_poll_interval: Duration::from_millis(200),
            submission_timeout: Duration::from_secs(10),
            max_active_environments_per_project: 10,
            preferred_zones: Vec::new(),
            storage_prefix: "experiments".to_string(),
            command_template: BASE64.encode(DEFAULT_COMMAND_TEMPLATE),
            experiment_types: default_experiment_types(),
            convergence_pattern: DEFAULT_CONVERGENCE_PATTERN.to_string(),
            worker_count: 4,
            worker_idle_poll: Duration::from_secs(1),
        }
    }
}

fn default_experiment_types() -> BTreeMap<String, ExperimentTypeConfig> {
    BTreeMap::from([
        (
            "vasp_std".to_string(),
            ExperimentTypeConfig::cpu("/opt/vasp/bin/vasp_std"),
        ),
        (
            "vasp_gam".to_string(),
            ExperimentTypeConfig::cpu("/opt/vasp/bin/vasp_gam"),
        ),
        (
            "vasp_ncl".to_string(),
            ExperimentTypeConfig::cpu("/opt/vasp/bin/vasp_ncl"),
        ),
        (
            "vasp_gpu".to_string(),
            ExperimentTypeConfig::gpu("/opt/vasp/bin/vasp_std_gpu"),
        ),
    ])
}

impl OrchestratorConfig {
    /// Reads configuration from `LABRUN_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is malformed or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a value is malformed or the
    /// resulting configuration is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let env = EnvReader { lookup: &lookup };

        env.string("LABRUN_QUEUE_NAME", &mut config.queue_name);
        env.duration("LABRUN_ENV_POLL_INTERVAL", &mut config.env_poll_interval)?;
        env.duration(
            "LABRUN_ENV_MONITOR_INITIAL_DELAY",
            &mut config.env_monitor_initial_delay,
        )?;
        env.duration(
            "LABRUN_COMPUTE_POLL_INTERVAL",
            &mut config.compute_poll_interval,
        )?;
        env.duration(
            "LABRUN_COMPUTE_MONITOR_INITIAL_DELAY",
            &mut config.compute_monitor_initial_delay,
        )?;
        env.duration("LABRUN_REDELIVERY_DELAY", &mut config.redelivery_delay)?;
        env.number("LABRUN_MAX_STEP_FAILURES", &mut config.max_step_failures)?;
        env.duration(
            "LABRUN_TEARDOWN_RETRY_DELAY",
            &mut config.teardown_retry_delay,
        )?;
        env.number(
            "LABRUN_TEARDOWN_MAX_RETRIES",
            &mut config.teardown_max_retries,
        )?;
        env.duration("LABRUN_NOTIFY_RETRY_DELAY", &mut config.notify_retry_delay)?;
        env.number("LABRUN_NOTIFY_MAX_ATTEMPTS", &mut config.notify_max_attempts)?;
        env.duration(
            "LABRUN_LAB_REQUEST_TIMEOUT",
            &mut config.lab_request_timeout,
        )?;
        env.duration("LABRUN_JOB_TIMEOUT", &mut config.job_timeout)?;
        env.duration(
            "LABRUN_SUBMISSION_LOCK_TTL",
            &mut config.submission_lock_ttl,
        )?;
        env.duration(
            "LABRUN_SUBMISSION_POLL_INTERVAL",
            &mut config.submission_poll_interval,
        )?;
        env.duration("LABRUN_SUBMISSION_TIMEOUT", &mut config.submission_timeout)?;
        env.number(
            "LABRUN_MAX_ACTIVE_ENVIRONMENTS",
            &mut config.max_active_environments_per_project,
        )?;
        if let Some(zones) = lookup("LABRUN_PREFERRED_ZONES") {
            config.preferred_zones = zones
                .split(',')
                .map(str::trim)
                .filter(|zone| !zone.is_empty())
                .map(str::to_string)
                .collect();
        }
        env.string("LABRUN_STORAGE_PREFIX", &mut config.storage_prefix);
        env.string("LABRUN_COMMAND_TEMPLATE", &mut config.command_template);
        if let Some(json) = lookup("LABRUN_EXPERIMENT_TYPES") {
            config.experiment_types = serde_json::from_str(&json).map_err(|e| {
                Error::configuration(format!("invalid LABRUN_EXPERIMENT_TYPES: {e}"))
            })?;
        }
        env.string(
            "LABRUN_CONVERGENCE_PATTERN",
            &mut config.convergence_pattern,
        );
        env.number("LABRUN_WORKER_COUNT", &mut config.worker_count)?;
        env.duration("LABRUN_WORKER_IDLE_POLL", &mut config.worker_idle_poll)?;

        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(Error::configuration("queue_name must not be empty"));
        }
        if self.worker_count == 0 {
            return Err(Error::configuration("worker_count must be greater than zero"));
        }
        if self.notify_max_attempts == 0 {
            return Err(Error::configuration(
                "notify_max_attempts must be greater than zero",
            ));
        }
        if self.submission_lock_ttl.is_zero() {
            return Err(Error::configuration(
                "submission_lock_ttl must be greater than zero",
            ));
        }
        if self.lab_request_timeout.is_zero() {
            return Err(Error::configuration(
                "lab_request_timeout must be greater than zero",
            ));
        }
        self.decoded_command_template()?;
        regex::Regex::new(&self.convergence_pattern)
            .map_err(|e| Error::configuration(format!("invalid convergence_pattern: {e}")))?;
        for (name, kind) in &self.experiment_types {
            if kind.executable.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "experiment type {name} has no executable"
                )));
            }
        }
        Ok(())
    }

    /// Decodes the command template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if it is not base64-encoded UTF-8.
    pub fn decoded_command_template(&self) -> Result<String> {
        let bytes = BASE64
            .decode(self.command_template.trim())
            .map_err(|e| Error::configuration(format!("command_template is not base64: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| Error::configuration(format!("command_template is not UTF-8: {e}")))
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = (self.lookup)(key) {
            *target = value;
        }
    }

    fn duration(&self, key: &str, target: &mut Duration) -> Result<()> {
        if let Some(value) = (self.lookup)(key) {
            *target = parse_duration(&value)
                .ok_or_else(|| Error::configuration(format!("invalid {key}: {value}")))?;
        }
        Ok(())
    }

    fn number<T: std::str::FromStr>(&self, key: &str, target: &mut T) -> Result<()> {
        if let Some(value) = (self.lookup)(key) {
            *target = value
                .trim()
                .parse()
                .map_err(|_| Error::configuration(format!("invalid {key}: {value}")))?;
        }
        Ok(())
    }
}

/// Parses `"200ms"`, `"30s"`, `"10m"`, `"72h"` or a bare number of seconds.
#[must_use]
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(amount)),
        "" | "s" => Some(Duration::from_secs(amount)),
        "m" => amount.checked_mul(60).map(Duration::from_secs),
        "h" => amount.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Formats a duration in the largest exact unit.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text)
                .ok_or_else(|| D::Error::custom(format!("invalid duration: {text}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_observed_cadence() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.env_poll_interval, Duration::from_secs(30));
        assert_eq!(config.teardown_retry_delay, Duration::from_secs(600));
        assert_eq!(config.teardown_max_retries, 6);
        assert_eq!(config.max_step_failures, 3);
        assert_eq!(config.notify_max_attempts, 3);
        assert_eq!(config.lab_request_timeout, Duration::from_secs(60));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("200ms"), Some(Duration::from_millis(200)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("72h"), Some(Duration::from_secs(259_200)));
        assert_eq!(parse_duration("3 days"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(200)), "200ms");
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
    }

    #[test]
    fn deserializes_partial_json() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"env_poll_interval": "5s", "teardown_retry_delay": 120, "worker_count": 2}"#,
        )
        .expect("parse");
        assert_eq!(config.env_poll_interval, Duration::from_secs(5));
        assert_eq!(config.teardown_retry_delay, Duration::from_secs(120));
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.queue_name, "labrun_tasks");
    }

    #[test]
    fn reads_environment_lookup() {
        let vars = HashMap::from([
            ("LABRUN_QUEUE_NAME", "vasp_queue"),
            ("LABRUN_SUBMISSION_POLL_INTERVAL", "50ms"),
            ("LABRUN_TEARDOWN_MAX_RETRIES", "4"),
            ("LABRUN_PREFERRED_ZONES", "ap-shanghai-2, ap-shanghai-4"),
            (
                "LABRUN_EXPERIMENT_TYPES",
                r#"{"vasp_gpu": {"executable": "/opt/vasp_gpu", "gpu": true}}"#,
            ),
        ]);
        let config =
            OrchestratorConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string()))
                .expect("config");
        assert_eq!(config.queue_name, "vasp_queue");
        assert_eq!(config.submission_poll_interval, Duration::from_millis(50));
        assert_eq!(config.teardown_max_retries, 4);
        assert_eq!(config.preferred_zones, vec!["ap-shanghai-2", "ap-shanghai-4"]);
        assert!(config.experiment_types["vasp_gpu"].gpu);
        assert_eq!(config.experiment_types.len(), 1);
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        let err = OrchestratorConfig::from_lookup(|key| {
            (key == "LABRUN_WORKER_COUNT").then(|| "many".to_string())
        })
        .expect_err("invalid");
        assert!(matches!(err, Error::Configuration { .. }));

        let err = OrchestratorConfig::from_lookup(|key| {
            (key == "LABRUN_CONVERGENCE_PATTERN").then(|| "(unclosed".to_string())
        })
        .expect_err("invalid regex");
        assert!(err.to_string().contains("convergence_pattern"));
    }

    #[test]
    fn default_template_decodes() {
        let template = OrchestratorConfig::default()
            .decoded_command_template()
            .expect("decode");
        assert!(template.contains("{executable}"));
        assert!(template.contains("{slots}"));
    }
}
