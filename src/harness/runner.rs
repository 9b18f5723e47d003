use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::config::{EvaluationConfig, EvaluationTarget, TaskId};
use super::results::EvaluationResults;

const RESULTS_FILE: &str = "results.json";
const CONFIG_FILE: &str = "config.json";

#[async_trait]
pub trait HarnessRunner: Send + Sync {
    /// Invoke the external harness exactly once against `target` with `eval`.
    /// Any failure propagates to the caller unchanged; there is no retry.
    async fn run(
        &self,
        target: &EvaluationTarget,
        eval: &EvaluationConfig,
        run_dir: &Path,
    ) -> Result<EvaluationResults>;
}

/// Runs the harness as a subprocess: the two configuration records are
/// written to `config.json` in the run directory, the harness program is
/// spawned with a bounded timeout, and `results.json` is read back from the
/// output directory on success.
pub struct ProcessHarnessRunner {
    binary: String,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessHarnessRunner {
    pub fn new(binary: impl Into<String>, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            max_output_bytes,
        }
    }

    fn output_dir(&self, eval: &EvaluationConfig, run_dir: &Path) -> PathBuf {
        eval.output_dir
            .clone()
            .unwrap_or_else(|| run_dir.to_path_buf())
    }
}

#[async_trait]
impl HarnessRunner for ProcessHarnessRunner {
    async fn run(
        &self,
        target: &EvaluationTarget,
        eval: &EvaluationConfig,
        run_dir: &Path,
    ) -> Result<EvaluationResults> {
        let output_dir = self.output_dir(eval, run_dir);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("Failed to create output dir {}", output_dir.display()))?;

        let config_path = run_dir.join(CONFIG_FILE);
        let config_json = serde_json::json!({
            "target": target,
            "eval": eval,
        });
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config_json)?)
            .await
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        if let Some(id) = TaskId::parse(&eval.task) {
            debug!(namespace = %id.harness, task = %id.task, "Task namespace");
        }
        info!(
            task = %eval.task,
            endpoint = %target.api_url(),
            harness = %self.binary,
            "Invoking evaluation harness"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--config")
            .arg(&config_path)
            .arg("--output")
            .arg(&output_dir)
            .env("EVAL_RUN_DIR", run_dir)
            .current_dir(run_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn harness '{}'", self.binary))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => anyhow::bail!("Harness process error: {}", e),
            Err(_) => anyhow::bail!(
                "Harness timed out after {}s (task {})",
                self.timeout.as_secs(),
                eval.task
            ),
        };

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = truncate_output(&output.stderr, self.max_output_bytes);
            anyhow::bail!(
                "Harness exited with code {} for task {}: {}",
                code,
                eval.task,
                stderr
            );
        }

        let stderr = truncate_output(&output.stderr, self.max_output_bytes);
        if !stderr.trim().is_empty() {
            warn!(task = %eval.task, "Harness stderr: {}", stderr.trim_end());
        }

        let results = EvaluationResults::from_file(&output_dir.join(RESULTS_FILE)).await?;
        info!(
            task = %eval.task,
            tasks_reported = %results.tasks.len(),
            "Harness completed"
        );
        Ok(results)
    }
}

fn truncate_output(raw: &[u8], max: usize) -> String {
    if raw.len() <= max {
        String::from_utf8_lossy(raw).to_string()
    } else {
        let t = String::from_utf8_lossy(&raw[..max]).to_string();
        format!(
            "{}\n\n... [truncated at {} bytes, total {}]",
            t,
            max,
            raw.len()
        )
    }
}
