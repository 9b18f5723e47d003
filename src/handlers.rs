use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::config::Config;
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::runs::{RunManager, RunRequest};

const MAX_TASK_LEN: usize = 256;
const MAX_ENDPOINT_LEN: usize = 2048;

pub struct AppState {
    pub config: Arc<Config>,
    pub runs: Arc<RunManager>,
    pub metrics: Arc<Metrics>,
    pub executor: Arc<Executor>,
    pub semaphore: Arc<Semaphore>,
    pub started_at: chrono::DateTime<Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/runs", post(submit_run).get(list_runs))
        .route("/runs/:id", get(get_run).delete(cancel_run))
        .route("/runs/:id/results", get(get_run_results))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: i64,
    active_runs: u64,
    total_runs: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    capacity: usize,
    available_slots: usize,
    current_server: Option<String>,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
        active_runs: state.runs.stats.active.load(Ordering::Relaxed),
        total_runs: state.runs.stats.created.load(Ordering::Relaxed),
        completed: state.runs.stats.completed.load(Ordering::Relaxed),
        failed: state.runs.stats.failed.load(Ordering::Relaxed),
        cancelled: state.runs.stats.cancelled.load(Ordering::Relaxed),
        capacity: state.config.max_concurrent_runs,
        available_slots: state.semaphore.available_permits(),
        current_server: state.executor.current_server(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

fn validate_request(payload: &RunRequest) -> Result<(), String> {
    if payload.eval.task.is_empty() {
        return Err("eval.task is required".to_string());
    }
    if payload.eval.task.len() > MAX_TASK_LEN {
        return Err(format!("eval.task too long (max {} chars)", MAX_TASK_LEN));
    }
    match (&payload.checkpoint, &payload.endpoint) {
        (None, None) => {
            return Err("one of checkpoint or endpoint is required".to_string());
        }
        (Some(_), Some(_)) => {
            return Err("checkpoint and endpoint are mutually exclusive".to_string());
        }
        _ => {}
    }
    if let Some(ref endpoint) = payload.endpoint {
        if endpoint.len() > MAX_ENDPOINT_LEN {
            return Err(format!("endpoint too long (max {} chars)", MAX_ENDPOINT_LEN));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err("endpoint must be an http(s) URL".to_string());
        }
    }
    Ok(())
}

async fn submit_run(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<RunRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(ref expected) = state.config.auth_token {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !auth::check_token(auth_header, expected) {
            return Err((StatusCode::UNAUTHORIZED, "Invalid token".to_string()));
        }
    }

    validate_request(&payload).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let permit = state.semaphore.clone().try_acquire_owned();
    let permit = match permit {
        Ok(p) => p,
        Err(_) => {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                format!(
                    "At capacity ({}/{}). Try again later.",
                    state.config.max_concurrent_runs, state.config.max_concurrent_runs
                ),
            ));
        }
    };

    let run = state.runs.create(payload);
    let id = run.id.clone();
    state.executor.spawn_run(run, permit);

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": id })),
    ))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let run = state.runs.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let result = run.result.lock().await;

    Ok(Json(serde_json::json!({
        "run_id": run.id,
        "task": run.request.eval.task,
        "status": result.status,
        "phase": result.phase,
        "results": result.results,
        "error": result.error,
        "server_exit": result.server_exit,
        "duration_ms": result.duration_ms,
        "output_dir": result.output_dir,
        "created_at": run.created_at.to_rfc3339(),
    })))
}

/// The results record alone, once the harness has produced one.
async fn get_run_results(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let run = state.runs.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let result = run.result.lock().await;

    match result.results {
        Some(ref results) => Ok(Json(serde_json::to_value(results).unwrap_or_default())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    if !state.runs.cancel(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": id, "cancelled": true })),
    ))
}

async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Vec<crate::runs::RunSummary>> {
    Json(state.runs.list_runs())
}
