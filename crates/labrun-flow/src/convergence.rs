//! Solver convergence: `OSZICAR` snapshots and the final-output check.
//!
//! Both read files the job writes next to its topology files, under the
//! experiment's object storage prefix.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use labrun_core::StorageBackend;

use crate::error::{Error, Result};

/// Convergence log written by the solver.
pub const OSZICAR_FILE: &str = "OSZICAR";
/// Solver stdout, redirected by the command template.
pub const SOLVER_LOG_FILE: &str = "vasp.log";

/// Latest convergence metrics of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OszicarSnapshot {
    /// Ionic steps completed.
    pub ionic_step: u32,
    /// Electronic step within the current ionic step.
    pub electronic_step: u32,
    /// Most recent energy (eV).
    pub energy: f64,
}

impl OszicarSnapshot {
    /// Parses `OSZICAR` content. Returns `None` if no step has been written yet.
    ///
    /// Electronic lines look like `DAV:   3   -0.4254E+02 ...`; ionic lines
    /// like `   1 F= -.42541243E+02 E0= ...`.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let mut snapshot: Option<Self> = None;
        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [method, step, energy, ..] if method.ends_with(':') => {
                    let (Ok(step), Some(energy)) = (step.parse::<u32>(), parse_energy(energy))
                    else {
                        continue;
                    };
                    let current = snapshot.get_or_insert(Self {
                        ionic_step: 0,
                        electronic_step: 0,
                        energy,
                    });
                    current.electronic_step = step;
                    current.energy = energy;
                }
                [step, "F=", energy, ..] => {
                    let (Ok(step), Some(energy)) = (step.parse::<u32>(), parse_energy(energy))
                    else {
                        continue;
                    };
                    let current = snapshot.get_or_insert(Self {
                        ionic_step: 0,
                        electronic_step: 0,
                        energy,
                    });
                    current.ionic_step = step;
                    current.energy = energy;
                }
                _ => {}
            }
        }
        snapshot
    }

    /// Serializes the snapshot for the `oszicar_json` column.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the energy is not finite.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }
}

fn parse_energy(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|energy| energy.is_finite())
}

/// Reads the latest `OSZICAR` snapshot under `prefix`.
///
/// The refresh is opportunistic: a missing or unreadable file yields `None`.
pub async fn read_snapshot(storage: &dyn StorageBackend, prefix: &str) -> Option<OszicarSnapshot> {
    let path = format!("{prefix}{OSZICAR_FILE}");
    match storage.get(&path).await {
        Ok(bytes) => OszicarSnapshot::parse(&String::from_utf8_lossy(&bytes)),
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "OSZICAR not readable");
            None
        }
    }
}

/// Outcome of the final-output check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceVerdict {
    /// The solver converged.
    Converged,
    /// The job finished but the output does not show convergence.
    NotConverged {
        /// Message for `err_msg`.
        reason: String,
    },
}

/// Decides whether a provider-reported success actually converged.
///
/// The predicate is a regex matched against the last non-empty line of the
/// solver log.
#[derive(Debug, Clone)]
pub struct ConvergenceCheck {
    pattern: Regex,
}

impl ConvergenceCheck {
    /// Compiles the predicate.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the pattern is not a valid regex.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::configuration(format!("invalid convergence pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Applies the predicate to log content.
    #[must_use]
    pub fn is_converged(&self, log: &str) -> bool {
        log.lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .is_some_and(|line| self.pattern.is_match(line))
    }

    /// Reads the solver log under `prefix` and applies the predicate.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read; callers treat
    /// that as transient.
    pub async fn evaluate(
        &self,
        storage: &Arc<dyn StorageBackend>,
        prefix: &str,
    ) -> Result<ConvergenceVerdict> {
        let path = format!("{prefix}{SOLVER_LOG_FILE}");
        let bytes = match storage.get(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Ok(ConvergenceVerdict::NotConverged {
                    reason: format!("convergence check failed: {SOLVER_LOG_FILE} not found"),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if self.is_converged(&String::from_utf8_lossy(&bytes)) {
            Ok(ConvergenceVerdict::Converged)
        } else {
            Ok(ConvergenceVerdict::NotConverged {
                reason: "convergence check failed: solver did not reach required accuracy"
                    .to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use labrun_core::{MemoryBackend, WritePrecondition};

    use super::*;

    const OSZICAR: &str = "       N       E                     dE             d eps       ncg     rms          rms(c)
DAV:   1    -0.425437311147E+02   -0.42544E+02   -0.20630E+03   512   0.305E+02
DAV:   2    -0.482812006212E+02   -0.57375E+01   -0.55180E+01   616   0.521E+01
   1 F= -.48281200E+02 E0= -.48277291E+02  d E =-.482812E+02
RMM:   1    -0.483001234567E+02   -0.18903E-01   -0.12345E-01   512   0.123E+00
";

    #[test]
    fn parses_latest_steps() {
        let snapshot = OszicarSnapshot::parse(OSZICAR).expect("snapshot");
        assert_eq!(snapshot.ionic_step, 1);
        assert_eq!(snapshot.electronic_step, 1);
        assert!((snapshot.energy - -48.300_123_456_7).abs() < 1e-9);
    }

    #[test]
    fn header_only_has_no_snapshot() {
        assert!(OszicarSnapshot::parse("   N   E   dE\n").is_none());
        assert!(OszicarSnapshot::parse("").is_none());
    }

    #[test]
    fn snapshot_json_shape() {
        let json = OszicarSnapshot {
            ionic_step: 3,
            electronic_step: 12,
            energy: -1.5,
        }
        .to_json()
        .expect("json");
        assert_eq!(json, r#"{"ionic_step":3,"electronic_step":12,"energy":-1.5}"#);
    }

    #[test]
    fn checks_last_non_empty_line() {
        let check = ConvergenceCheck::new(r"reached required accuracy").expect("regex");
        assert!(check.is_converged(
            "step 1\n reached required accuracy - stopping structural energy minimisation\n\n"
        ));
        assert!(!check.is_converged("reached required accuracy\nSEGFAULT\n"));
        assert!(!check.is_converged(""));
    }

    #[test]
    fn invalid_pattern_is_configuration_error() {
        assert!(matches!(
            ConvergenceCheck::new("(").expect_err("invalid"),
            Error::Configuration { .. }
        ));
    }

    #[tokio::test]
    async fn evaluate_reads_solver_log() -> Result<()> {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let check = ConvergenceCheck::new("accuracy")?;

        let verdict = check.evaluate(&storage, "experiments/1/2/").await?;
        assert!(matches!(verdict, ConvergenceVerdict::NotConverged { .. }));

        storage
            .put(
                "experiments/1/2/vasp.log",
                Bytes::from_static(b"reached required accuracy\n"),
                WritePrecondition::None,
            )
            .await?;
        assert_eq!(
            check.evaluate(&storage, "experiments/1/2/").await?,
            ConvergenceVerdict::Converged
        );
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_refresh_tolerates_missing_file() -> Result<()> {
        let storage = MemoryBackend::new();
        assert!(read_snapshot(&storage, "experiments/1/2/").await.is_none());

        storage
            .put(
                "experiments/1/2/OSZICAR",
                Bytes::from_static(OSZICAR.as_bytes()),
                WritePrecondition::None,
            )
            .await?;
        assert!(read_snapshot(&storage, "experiments/1/2/").await.is_some());
        Ok(())
    }
}
