use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use sync_core::config::TransformConfig;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

/// Downstream step that turns landed raw data into modelled tables.
#[async_trait]
pub trait TransformTrigger: Send + Sync {
    async fn run(&self) -> TransformOutcome;
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformOutcome {
    pub steps: Vec<StepOutcome>,
}

impl TransformOutcome {
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.success)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.success)
            .map(|s| s.step.as_str())
            .collect()
    }
}

/// Runs `<command> <step>` for each configured step, e.g. `dbt run`.
pub struct DbtRunner {
    command: String,
    steps: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl DbtRunner {
    pub fn new(command: impl Into<String>, steps: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            steps,
            working_dir,
        }
    }

    pub fn from_config(config: &TransformConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.steps.clone(),
            config.working_dir.clone(),
        )
    }

    async fn run_step(&self, step: &str) -> StepOutcome {
        let mut command = Command::new(&self.command);
        command.args(step.split_whitespace()).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let description = format!("{} {}", self.command, step).trim().to_string();
        info!(command = %description, "Running transformation step");

        match command.output().await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let success = output.status.success();

                if success {
                    info!(command = %description, "Transformation step completed successfully");
                    debug!(command = %description, output = %stdout, "Step stdout");
                    if !stderr.is_empty() {
                        warn!(command = %description, stderr = %stderr, "Step wrote to stderr");
                    }
                } else {
                    error!(
                        command = %description,
                        exit_code = ?output.status.code(),
                        stdout = %stdout,
                        stderr = %stderr,
                        "Transformation step failed"
                    );
                }

                StepOutcome {
                    step: step.to_string(),
                    success,
                    exit_code: output.status.code(),
                    stdout,
                    stderr,
                }
            }
            Err(e) => {
                let stderr = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("{} command not found; is it installed and on PATH?", self.command)
                } else {
                    format!("failed to start {}: {}", self.command, e)
                };
                error!(command = %description, error = %e, "{}", stderr);

                StepOutcome {
                    step: step.to_string(),
                    success: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr,
                }
            }
        }
    }
}

#[async_trait]
impl TransformTrigger for DbtRunner {
    #[instrument(skip(self), fields(command = %self.command))]
    async fn run(&self) -> TransformOutcome {
        let started = Instant::now();
        let mut outcome = TransformOutcome::default();

        // Later steps still run after a failure, mirroring a CI-style pipeline
        for step in &self.steps {
            outcome.steps.push(self.run_step(step).await);
        }

        let succeeded = outcome.steps.iter().filter(|s| s.success).count();
        info!(
            duration_ms = started.elapsed().as_millis(),
            succeeded,
            total = outcome.steps.len(),
            "Transformation pipeline finished"
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn all_steps_succeeding_is_success() {
        let runner = DbtRunner::new("true", vec!["run".into(), "test".into()], None);
        let outcome = runner.run().await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn failing_step_fails_the_outcome_but_later_steps_run() {
        let runner = DbtRunner::new("sh", vec!["-c false".into(), "-c true".into()], None);
        let outcome = runner.run().await;

        assert_eq!(outcome.steps.len(), 2);
        assert!(!outcome.steps[0].success);
        assert!(outcome.steps[1].success);
        assert!(!outcome.succeeded());
        assert_eq!(outcome.failed_steps(), ["-c false"]);

        let failing = DbtRunner::new("false", vec!["run".into(), "test".into()], None);
        let outcome = failing.run().await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.failed_steps(), ["run", "test"]);
        assert_eq!(outcome.steps[0].exit_code, Some(1));
    }

    #[tokio::test]
    async fn captures_output() {
        let runner = DbtRunner::new("echo", vec!["models built".into()], None);
        let outcome = runner.run().await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.steps[0].stdout.trim(), "models built");
    }

    #[tokio::test]
    async fn missing_command_is_a_failure_not_a_crash() {
        let runner = DbtRunner::new("definitely-not-installed-dbt", vec!["run".into()], None);
        let outcome = runner.run().await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.steps[0].exit_code, None);
        assert!(outcome.steps[0].stderr.contains("command not found"));
    }

    #[tokio::test]
    async fn runs_in_working_dir() {
        let dir = std::env::temp_dir();
        let runner = DbtRunner::new("pwd", vec![String::new()], Some(dir.clone()));
        let outcome = runner.run().await;

        assert!(outcome.succeeded());
        let reported = std::path::PathBuf::from(outcome.steps[0].stdout.trim());
        assert_eq!(reported.canonicalize().unwrap(), dir.canonicalize().unwrap());
    }

    #[test]
    fn no_steps_is_trivially_successful() {
        assert!(TransformOutcome::default().succeeded());
    }
}
