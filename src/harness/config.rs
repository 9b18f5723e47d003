use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which of the two serving endpoints evaluation requests are sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKind {
    Completions,
    Chat,
}

impl Default for ApiKind {
    fn default() -> Self {
        Self::Completions
    }
}

impl ApiKind {
    pub fn path(&self) -> &'static str {
        match self {
            ApiKind::Completions => "/v1/completions",
            ApiKind::Chat => "/v1/chat/completions",
        }
    }
}

/// Where the harness sends its requests. Constructed once per run and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTarget {
    pub url: String,
    pub api: ApiKind,
}

impl EvaluationTarget {
    pub fn new(url: impl Into<String>, api: ApiKind) -> Self {
        Self {
            url: url.into(),
            api,
        }
    }

    /// Full URL of the API path requests go to.
    pub fn api_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.api.path())
    }
}

/// Which benchmark task to run and with what parameters. The task identifier
/// is namespaced as `<harness>.<task>` and resolved by the external harness
/// registry; `params` is passed through opaquely (log-likelihood tasks expect
/// tokenizer fields there, generation tasks none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub task: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[allow(dead_code)]
impl EvaluationConfig {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            params: serde_json::Value::Null,
            limit: None,
            output_dir: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

/// Split view of a namespaced task identifier. A malformed identifier is not
/// rejected here; it simply fails inside the harness.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskId<'a> {
    pub harness: &'a str,
    pub task: &'a str,
}

impl<'a> TaskId<'a> {
    pub fn parse(raw: &'a str) -> Option<Self> {
        let (harness, task) = raw.split_once('.')?;
        if harness.is_empty() || task.is_empty() {
            return None;
        }
        Some(Self { harness, task })
    }
}
