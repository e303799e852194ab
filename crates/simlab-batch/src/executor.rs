//! The scenario-executor seam: the opaque, billable unit of work every
//! run dispatches into, plus the bundled subprocess adapter.

use crate::error::{RunError, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Terminal status reported by the executor for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Completed,
    Paused,
    Failed,
}

/// What one scenario execution cost and how it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub total_cost: f64,
    pub status: ExecutorStatus,
}

/// The external collaborator that actually runs a scenario. Raising
/// `RunError::RateLimited` here is the only sanctioned origin of
/// rate-limit signals; everything downstream is a type match.
#[async_trait]
pub trait ScenarioExecutor: Send + Sync {
    async fn run(
        &self,
        scenario_path: &Path,
        output_dir: &Path,
        cost_ceiling: Option<f64>,
    ) -> Result<RunOutcome, RunError>;
}

/// On-disk result contract written by the harness into the run's
/// output directory.
#[derive(Debug, Deserialize)]
struct HarnessResult {
    total_cost: f64,
    status: String,
    #[serde(default)]
    retry_after_seconds: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    severity: Option<String>,
}

/// Subprocess-backed executor: spawns the configured harness command
/// with the scenario and output locations, then reads
/// `run_result.json` from the output directory.
#[derive(Debug)]
pub struct HarnessExecutor {
    command: Vec<String>,
}

impl HarnessExecutor {
    pub fn new(command: Vec<String>) -> Result<Self, RunError> {
        if command.is_empty() {
            return Err(RunError::fatal(
                "harness_command_missing: config declares no harness command",
            ));
        }
        Ok(Self { command })
    }
}

#[async_trait]
impl ScenarioExecutor for HarnessExecutor {
    async fn run(
        &self,
        scenario_path: &Path,
        output_dir: &Path,
        cost_ceiling: Option<f64>,
    ) -> Result<RunOutcome, RunError> {
        let mut command = Command::new(&self.command[0]);
        command.args(&self.command[1..]);
        command.arg("--scenario").arg(scenario_path);
        command.arg("--output").arg(output_dir);
        if let Some(ceiling) = cost_ceiling {
            command.arg("--cost-ceiling").arg(ceiling.to_string());
        }
        debug!(program = %self.command[0], "spawning scenario harness");
        let status = command.status().await?;

        let result_path = output_dir.join("run_result.json");
        let bytes = match std::fs::read(&result_path) {
            Ok(bytes) => bytes,
            Err(_) if !status.success() => {
                return Err(RunError::scenario(
                    Severity::High,
                    format!(
                        "harness_exit_nonzero: exit status {:?} and no run_result.json",
                        status.code()
                    ),
                ));
            }
            Err(e) => {
                return Err(RunError::scenario(
                    Severity::Medium,
                    format!("harness_result_missing: {}: {}", result_path.display(), e),
                ));
            }
        };
        let result: HarnessResult = serde_json::from_slice(&bytes).map_err(|e| {
            RunError::scenario(
                Severity::Medium,
                format!("harness_result_invalid: {}: {}", result_path.display(), e),
            )
        })?;

        match result.status.as_str() {
            "completed" => Ok(RunOutcome {
                total_cost: result.total_cost,
                status: ExecutorStatus::Completed,
            }),
            "paused" => Ok(RunOutcome {
                total_cost: result.total_cost,
                status: ExecutorStatus::Paused,
            }),
            "rate_limited" => Err(RunError::RateLimited {
                retry_after: result.retry_after_seconds.map(Duration::from_secs),
            }),
            "failed" => {
                let message = result
                    .error
                    .unwrap_or_else(|| "harness reported failure".to_string());
                match result.severity.as_deref() {
                    Some("fatal") => Err(RunError::fatal(message)),
                    Some("low") => Err(RunError::scenario(Severity::Low, message)),
                    Some("high") => Err(RunError::scenario(Severity::High, message)),
                    _ => Err(RunError::scenario(Severity::Medium, message)),
                }
            }
            other => Err(RunError::scenario(
                Severity::Medium,
                format!("harness_status_unknown: {}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "simlab_exec_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn write_result_harness(result_json: &str) -> Vec<String> {
        // A harness that ignores its arguments and writes a fixed
        // result file into the --output directory (arg after the flag).
        let script = format!(
            r#"out=""; prev=""; for a in "$@"; do if [ "$prev" = "--output" ]; then out="$a"; fi; prev="$a"; done; mkdir -p "$out"; printf '%s' '{}' > "$out/run_result.json""#,
            result_json
        );
        vec!["sh".to_string(), "-c".to_string(), script, "sh".to_string()]
    }

    #[tokio::test]
    async fn completed_result_round_trips() {
        let root = temp_root("ok");
        simlab_core::ensure_dir(&root).expect("root");
        let executor = HarnessExecutor::new(write_result_harness(
            r#"{"total_cost": 0.42, "status": "completed"}"#,
        ))
        .expect("executor");
        let outcome = executor
            .run(Path::new("scenario.yaml"), &root.join("out"), Some(1.0))
            .await
            .expect("run");
        assert_eq!(outcome.status, ExecutorStatus::Completed);
        assert!((outcome.total_cost - 0.42).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn rate_limited_result_becomes_structured_error() {
        let root = temp_root("ratelimit");
        simlab_core::ensure_dir(&root).expect("root");
        let executor = HarnessExecutor::new(write_result_harness(
            r#"{"total_cost": 0.0, "status": "rate_limited", "retry_after_seconds": 30}"#,
        ))
        .expect("executor");
        let err = executor
            .run(Path::new("scenario.yaml"), &root.join("out"), None)
            .await
            .expect_err("must be rate limited");
        match err {
            RunError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn fatal_severity_maps_to_fatal_error() {
        let root = temp_root("fatal");
        simlab_core::ensure_dir(&root).expect("root");
        let executor = HarnessExecutor::new(write_result_harness(
            r#"{"total_cost": 0.1, "status": "failed", "error": "corrupt scenario", "severity": "fatal"}"#,
        ))
        .expect("executor");
        let err = executor
            .run(Path::new("scenario.yaml"), &root.join("out"), None)
            .await
            .expect_err("must fail");
        assert!(err.is_fatal());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn nonzero_exit_without_result_is_high_severity() {
        let root = temp_root("exit");
        simlab_core::ensure_dir(&root).expect("root");
        let executor =
            HarnessExecutor::new(vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()])
                .expect("executor");
        let err = executor
            .run(Path::new("scenario.yaml"), &root.join("out"), None)
            .await
            .expect_err("must fail");
        assert_eq!(err.severity(), Severity::High);
        assert!(!err.is_fatal());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = HarnessExecutor::new(vec![]).expect_err("must fail");
        assert!(err.is_fatal());
    }
}
