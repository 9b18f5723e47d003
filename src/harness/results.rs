use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub type TaskMetrics = BTreeMap<String, serde_json::Value>;

/// The results record as the harness wrote it: a per-task mapping of metric
/// name to value. Read once per run, never transformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub tasks: BTreeMap<String, TaskMetrics>,
}

impl EvaluationResults {
    pub fn task(&self, id: &str) -> Option<&TaskMetrics> {
        self.tasks.get(id)
    }

    #[allow(dead_code)]
    pub fn metric(&self, task: &str, name: &str) -> Option<f64> {
        self.tasks.get(task)?.get(name)?.as_f64()
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read results file {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse results file {}", path.display()))
    }
}
