use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::harness::config::{ApiKind, EvaluationConfig};
use crate::harness::results::EvaluationResults;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One evaluation request as submitted over the wire. Exactly one of
/// `checkpoint` (deploy a server first) or `endpoint` (evaluate an already
/// running server) must be present; handlers enforce this before a run is
/// created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api: ApiKind,
    pub eval: EvaluationConfig,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    StartingServer,
    WaitingReady,
    RunningHarness,
    StoppingServer,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub phase: RunPhase,
    pub results: Option<EvaluationResults>,
    pub error: Option<String>,
    pub server_exit: Option<i32>,
    pub duration_ms: Option<u64>,
    pub output_dir: Option<PathBuf>,
}

impl RunResult {
    fn queued() -> Self {
        Self {
            status: RunStatus::Pending,
            phase: RunPhase::Queued,
            results: None,
            error: None,
            server_exit: None,
            duration_ms: None,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub event: String,
    pub run_id: String,
    pub data: serde_json::Value,
}

pub struct Run {
    pub id: String,
    pub request: RunRequest,
    pub result: Arc<Mutex<RunResult>>,
    pub created_at: DateTime<Utc>,
    pub cancel: tokio::sync::watch::Sender<bool>,
    pub events_tx: broadcast::Sender<RunEvent>,
}

impl Run {
    /// Broadcast a lifecycle event. Send failures mean nobody is listening,
    /// which is fine.
    pub fn emit_event(&self, event: &str, data: serde_json::Value) {
        let _ = self.events_tx.send(RunEvent {
            event: event.to_string(),
            run_id: self.id.clone(),
            data,
        });
    }
}

pub struct RunStats {
    pub created: AtomicU64,
    pub active: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            active: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }
}

pub struct RunManager {
    runs: DashMap<String, Arc<Run>>,
    ttl_secs: u64,
    pub stats: RunStats,
}

impl RunManager {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            runs: DashMap::new(),
            ttl_secs,
            stats: RunStats::new(),
        }
    }

    pub fn create(&self, request: RunRequest) -> Arc<Run> {
        let id = uuid::Uuid::new_v4().to_string();
        let (cancel_tx, _) = tokio::sync::watch::channel(false);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let run = Arc::new(Run {
            id: id.clone(),
            request,
            result: Arc::new(Mutex::new(RunResult::queued())),
            created_at: Utc::now(),
            cancel: cancel_tx,
            events_tx,
        });

        self.runs.insert(id, run.clone());
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        run
    }

    pub fn get(&self, id: &str) -> Option<Arc<Run>> {
        self.runs.get(id).map(|r| r.value().clone())
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        self.runs
            .iter()
            .map(|entry| {
                let r = entry.value();
                RunSummary {
                    id: r.id.clone(),
                    task: r.request.eval.task.clone(),
                    checkpoint: r
                        .request
                        .checkpoint
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    endpoint: r.request.endpoint.clone(),
                    created_at: r.created_at,
                }
            })
            .collect()
    }

    pub fn mark_completed(&self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_failed(&self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_cancelled(&self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Request cancellation of a run. Returns false if the id is unknown.
    pub fn cancel(&self, id: &str) -> bool {
        match self.runs.get(id) {
            Some(run) => {
                let _ = run.cancel.send(true);
                true
            }
            None => false,
        }
    }

    pub async fn reaper_loop(&self) {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = Utc::now();
            let mut expired = Vec::new();

            for entry in self.runs.iter() {
                let age = (now - entry.value().created_at).num_seconds() as u64;
                if age > self.ttl_secs {
                    expired.push(entry.key().clone());
                }
            }

            for id in expired {
                if let Some((_, run)) = self.runs.remove(&id) {
                    let _ = run.cancel.send(true);
                    info!("Reaped expired run {}", id);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub task: String,
    pub checkpoint: Option<String>,
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> RunRequest {
        RunRequest {
            checkpoint: Some(PathBuf::from("/models/ckpt")),
            endpoint: None,
            api: ApiKind::Completions,
            eval: EvaluationConfig::new("lm-eval.hellaswag"),
            timeout_secs: None,
        }
    }

    #[test]
    fn test_create_and_get() {
        let mgr = RunManager::new(3600);
        let run = mgr.create(test_request());
        assert_eq!(mgr.stats.created.load(Ordering::Relaxed), 1);
        assert_eq!(mgr.stats.active.load(Ordering::Relaxed), 1);

        let fetched = mgr.get(&run.id).expect("run should exist");
        assert_eq!(fetched.id, run.id);
        assert!(mgr.get("missing-id").is_none());
    }

    #[test]
    fn test_list_runs_carries_task() {
        let mgr = RunManager::new(3600);
        mgr.create(test_request());
        let runs = mgr.list_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].task, "lm-eval.hellaswag");
        assert_eq!(runs[0].checkpoint.as_deref(), Some("/models/ckpt"));
    }

    #[test]
    fn test_cancel_sets_watch() {
        let mgr = RunManager::new(3600);
        let run = mgr.create(test_request());
        let rx = run.cancel.subscribe();
        assert!(!*rx.borrow());
        assert!(mgr.cancel(&run.id));
        assert!(*rx.borrow());
        assert!(!mgr.cancel("missing-id"));
    }

    #[tokio::test]
    async fn test_initial_result_is_queued() {
        let mgr = RunManager::new(3600);
        let run = mgr.create(test_request());
        let result = run.result.lock().await;
        assert_eq!(result.status, RunStatus::Pending);
        assert_eq!(result.phase, RunPhase::Queued);
        assert!(result.results.is_none());
    }

    #[test]
    fn test_emit_event_without_subscribers() {
        let mgr = RunManager::new(3600);
        let run = mgr.create(test_request());
        // No receiver attached; must not panic.
        run.emit_event("run_started", serde_json::json!({}));
    }
}
