use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::deploy::{self, ServerSpec};
use crate::endpoint::EndpointClient;
use crate::harness::config::EvaluationTarget;
use crate::harness::results::EvaluationResults;
use crate::harness::runner::{HarnessRunner, ProcessHarnessRunner};
use crate::metrics::Metrics;
use crate::runs::{Run, RunManager, RunPhase, RunStatus};

pub struct Executor {
    config: Arc<Config>,
    runs: Arc<RunManager>,
    metrics: Arc<Metrics>,
    runner: Arc<dyn HarnessRunner>,
    current_server: parking_lot::Mutex<Option<String>>,
}

impl Executor {
    pub fn new(config: Arc<Config>, runs: Arc<RunManager>, metrics: Arc<Metrics>) -> Self {
        let runner = Arc::new(ProcessHarnessRunner::new(
            config.harness_bin.clone(),
            Duration::from_secs(config.eval_timeout_secs),
            config.max_output_bytes,
        ));
        Self {
            config,
            runs,
            metrics,
            runner,
            current_server: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn HarnessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Base URL of the serving process currently deployed, if any.
    pub fn current_server(&self) -> Option<String> {
        self.current_server.lock().clone()
    }

    /// Run the pipeline for one accepted request on a background task. The
    /// permit is held until the run finishes, which is what bounds
    /// concurrent deployments.
    pub fn spawn_run(self: &Arc<Self>, run: Arc<Run>, permit: OwnedSemaphorePermit) {
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(run).await;
            drop(permit);
        });
    }

    async fn execute(self: Arc<Self>, run: Arc<Run>) {
        let start = std::time::Instant::now();
        self.metrics.start_run();

        {
            let mut res = run.result.lock().await;
            res.status = RunStatus::Running;
        }
        run.emit_event(
            "run_started",
            serde_json::json!({
                "task": run.request.eval.task,
                "checkpoint": run.request.checkpoint,
                "endpoint": run.request.endpoint,
            }),
        );

        let outcome = self.run_pipeline(&run).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        let cancelled = *run.cancel.subscribe().borrow();

        let mut res = run.result.lock().await;
        res.duration_ms = Some(duration_ms);
        res.phase = RunPhase::Done;

        match outcome {
            Ok(results) => {
                if results.task(&run.request.eval.task).is_none() {
                    warn!(
                        run_id = %run.id,
                        task = %run.request.eval.task,
                        "Results contain no entry for the requested task"
                    );
                }
                info!(
                    run_id = %run.id,
                    task = %run.request.eval.task,
                    duration_ms = %duration_ms,
                    "Run completed"
                );
                res.status = RunStatus::Completed;
                res.results = Some(results);
                self.metrics.finish_run(true, duration_ms);
                self.runs.mark_completed();
            }
            Err(e) if cancelled => {
                warn!(run_id = %run.id, "Run cancelled");
                res.status = RunStatus::Cancelled;
                res.error = Some(format!("{:#}", e));
                self.metrics.cancel_run(duration_ms);
                self.runs.mark_cancelled();
            }
            Err(e) => {
                error!(run_id = %run.id, error = %format!("{:#}", e), "Run failed");
                res.status = RunStatus::Failed;
                res.error = Some(format!("{:#}", e));
                self.metrics.finish_run(false, duration_ms);
                self.runs.mark_failed();
            }
        }

        run.emit_event(
            "run_complete",
            serde_json::json!({
                "status": res.status,
                "duration_ms": duration_ms,
                "error": res.error,
            }),
        );
    }

    async fn run_pipeline(&self, run: &Arc<Run>) -> Result<EvaluationResults> {
        let req = &run.request;
        let mut cancel_rx = run.cancel.subscribe();

        let run_dir = self.config.output_base.join(&run.id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run dir {}", run_dir.display()))?;
        set_output_dir(run, run_dir.clone()).await;

        if *cancel_rx.borrow() {
            anyhow::bail!("Cancelled before start");
        }

        // Deploy a server unless the request targets one that already runs.
        let (target_url, server) = match (&req.endpoint, &req.checkpoint) {
            (Some(url), _) => (url.clone(), None),
            (None, Some(checkpoint)) => {
                set_phase(run, RunPhase::StartingServer).await;
                run.emit_event(
                    "server_starting",
                    serde_json::json!({ "checkpoint": checkpoint }),
                );
                self.metrics.record_server_start();

                let spec = ServerSpec::from_config(&self.config, checkpoint);
                let mut handle = match deploy::launch(&spec, &run_dir).await {
                    Ok(h) => h,
                    Err(e) => {
                        self.metrics.record_server_failure();
                        return Err(e.into());
                    }
                };

                set_phase(run, RunPhase::WaitingReady).await;
                let client = EndpointClient::new()?;
                let ready_timeout = Duration::from_secs(self.config.ready_timeout_secs);
                if let Err(e) = handle.wait_ready(&client, ready_timeout).await {
                    self.metrics.record_server_failure();
                    // Dropping the handle still kills the child.
                    return Err(e.into());
                }

                // Short smoke completion against the advertised path before
                // the harness is pointed at it.
                let model = checkpoint
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "checkpoint".to_string());
                let smoke_target = EvaluationTarget::new(&handle.base_url, req.api);
                if let Err(e) = client.smoke_completion(&smoke_target, &model, "Hello").await {
                    warn!(run_id = %run.id, "Smoke completion failed: {:#}", e);
                }

                run.emit_event("server_ready", serde_json::json!({ "url": handle.base_url }));
                *self.current_server.lock() = Some(handle.base_url.clone());
                (handle.base_url.clone(), Some(handle))
            }
            (None, None) => anyhow::bail!("Run has neither a checkpoint nor an endpoint"),
        };

        let target = EvaluationTarget::new(&target_url, req.api);

        set_phase(run, RunPhase::RunningHarness).await;
        run.emit_event(
            "harness_started",
            serde_json::json!({ "task": req.eval.task, "endpoint": target.api_url() }),
        );

        let eval_future = self.runner.run(&target, &req.eval, &run_dir);
        let eval_outcome = tokio::select! {
            outcome = maybe_timeout(req.timeout_secs, eval_future) => outcome,
            _ = cancel_rx.changed() => Err(anyhow::anyhow!("Cancelled during evaluation")),
        };

        // The stop signal is attempted no matter how the harness call went.
        if let Some(handle) = server {
            set_phase(run, RunPhase::StoppingServer).await;
            *self.current_server.lock() = None;
            let grace = Duration::from_secs(self.config.stop_grace_secs);
            match handle.stop(grace).await {
                Ok(code) => {
                    run.emit_event("server_stopped", serde_json::json!({ "exit_code": code }));
                    let mut res = run.result.lock().await;
                    res.server_exit = code;
                }
                Err(e) => warn!(run_id = %run.id, "Server stop failed: {:#}", e),
            }
        }

        eval_outcome
    }
}

async fn maybe_timeout(
    timeout_secs: Option<u64>,
    fut: impl std::future::Future<Output = Result<EvaluationResults>>,
) -> Result<EvaluationResults> {
    match timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), fut).await {
            Ok(outcome) => outcome,
            Err(_) => anyhow::bail!("Evaluation timed out after {}s", secs),
        },
        None => fut.await,
    }
}

async fn set_phase(run: &Arc<Run>, phase: RunPhase) {
    let mut res = run.result.lock().await;
    res.phase = phase;
}

async fn set_output_dir(run: &Arc<Run>, dir: PathBuf) {
    let mut res = run.result.lock().await;
    res.output_dir = Some(dir);
}
