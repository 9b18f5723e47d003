use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::handlers::AppState;
use crate::runs::RunEvent;

#[derive(Deserialize)]
pub struct WsQuery {
    pub run_id: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    let run_id = query.run_id;
    ws.on_upgrade(move |socket| handle_ws(socket, state, run_id))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, run_id: String) {
    let run = match state.runs.get(&run_id) {
        Some(r) => r,
        None => {
            let (mut sender, _) = socket.split();
            let err = serde_json::json!({
                "error": "run_not_found",
                "run_id": run_id,
            });
            let msg = serde_json::to_string(&err).unwrap_or_default();
            let _ = sender.send(Message::Text(msg)).await;
            return;
        }
    };

    info!("WebSocket connected for run {}", run_id);

    let mut rx: broadcast::Receiver<RunEvent> = run.events_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let current = run.result.lock().await;
    let snapshot = serde_json::json!({
        "event": "snapshot",
        "run_id": run_id,
        "data": {
            "status": current.status,
            "phase": current.phase,
            "results": current.results,
            "error": current.error,
            "duration_ms": current.duration_ms,
        }
    });
    drop(current);

    let snapshot_json = serde_json::to_string(&snapshot).unwrap_or_default();
    if sender.send(Message::Text(snapshot_json)).await.is_err() {
        return;
    }

    let run_id_send = run_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(_) => continue,
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("WebSocket lagged by {} messages", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let close_msg = serde_json::json!({
                        "event": "stream_closed",
                        "run_id": run_id_send,
                    });
                    let close_json = serde_json::to_string(&close_msg).unwrap_or_default();
                    let _ = sender.send(Message::Text(close_json)).await;
                    break;
                }
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!("Received ping");
                }
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("WebSocket disconnected for run {}", run_id);
}
