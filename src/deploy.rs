use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::cleanup;
use crate::config::Config;
use crate::endpoint::EndpointClient;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SERVER_LOG_FILE: &str = "server.log";
const LOG_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("checkpoint path {0} does not exist")]
    CheckpointMissing(PathBuf),
    #[error("failed to spawn serving process '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serving process exited (code {code:?}) before becoming ready: {log_tail}")]
    EarlyExit { code: Option<i32>, log_tail: String },
    #[error("serving process not ready after {0}s")]
    ReadyTimeout(u64),
    #[error("failed to set up server log file: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to start one serving process. Host and port come from
/// the same Config value the driver derives its target URL from.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub binary: String,
    pub checkpoint: PathBuf,
    pub host: String,
    pub port: u16,
}

impl ServerSpec {
    pub fn from_config(config: &Config, checkpoint: &Path) -> Self {
        Self {
            binary: config.server_bin.clone(),
            checkpoint: checkpoint.to_path_buf(),
            host: config.server_host.clone(),
            port: config.server_port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Handle to a spawned serving process. `stop` is the orderly path; if the
/// handle is dropped without it, the child is still killed.
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
    pub base_url: String,
    log_path: PathBuf,
    stopped: bool,
}

/// Spawn the serving process for a checkpoint. The spawn itself is
/// non-blocking; readiness is a separate step.
pub async fn launch(spec: &ServerSpec, run_dir: &Path) -> Result<ServerHandle, DeployError> {
    if tokio::fs::metadata(&spec.checkpoint).await.is_err() {
        return Err(DeployError::CheckpointMissing(spec.checkpoint.clone()));
    }

    let log_path = run_dir.join(SERVER_LOG_FILE);
    let log = std::fs::File::create(&log_path)?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(&spec.binary);
    cmd.arg("--checkpoint")
        .arg(&spec.checkpoint)
        .arg("--host")
        .arg(&spec.host)
        .arg("--port")
        .arg(spec.port.to_string())
        .stdout(std::process::Stdio::from(log))
        .stderr(std::process::Stdio::from(log_err));
    // New process group so stop can signal the whole tree.
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|source| DeployError::Spawn {
        binary: spec.binary.clone(),
        source,
    })?;

    info!(
        pid = ?child.id(),
        binary = %spec.binary,
        checkpoint = %spec.checkpoint.display(),
        url = %spec.base_url(),
        "Serving process spawned"
    );

    Ok(ServerHandle {
        child,
        base_url: spec.base_url(),
        log_path,
        stopped: false,
    })
}

impl ServerHandle {
    /// Poll the health endpoint until the server answers, the process dies,
    /// or the deadline passes.
    pub async fn wait_ready(
        &mut self,
        client: &EndpointClient,
        timeout: Duration,
    ) -> Result<(), DeployError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(DeployError::EarlyExit {
                    code: status.code(),
                    log_tail: self.log_tail().await,
                });
            }

            if client.is_healthy(&self.base_url).await {
                info!(url = %self.base_url, "Serving process ready");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(DeployError::ReadyTimeout(timeout.as_secs()));
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Last bytes of the server log, for error reporting.
    pub async fn log_tail(&self) -> String {
        let data = tokio::fs::read(&self.log_path).await.unwrap_or_default();
        let start = data.len().saturating_sub(LOG_TAIL_BYTES);
        String::from_utf8_lossy(&data[start..]).trim().to_string()
    }

    /// Best-effort graceful stop: interrupt the process group, wait out the
    /// grace period, then kill. There is no drain guarantee for requests
    /// still in flight. Returns the exit code when the process reported one.
    pub async fn stop(mut self, grace: Duration) -> Result<Option<i32>> {
        self.stopped = true;
        let pid = self.child.id();

        if let Some(pid) = pid {
            info!(pid = %pid, "Stopping serving process");
            cleanup::signal_process_group(pid, "INT").await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Ok(status.code()),
            Ok(Err(e)) => Err(e).context("Failed waiting for serving process to exit"),
            Err(_) => {
                warn!(
                    "Serving process ignored interrupt for {}s, killing",
                    grace.as_secs()
                );
                if let Some(pid) = pid {
                    cleanup::signal_process_group(pid, "KILL").await;
                }
                let _ = self.child.kill().await;
                Ok(None)
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.stopped {
            warn!("Server handle dropped without stop, killing child");
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    async fn script_spec(dir: &Path, body: &str, port: u16) -> ServerSpec {
        let path = dir.join("fake-server.sh");
        tokio::fs::write(&path, body).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        ServerSpec {
            binary: path.to_string_lossy().to_string(),
            checkpoint: dir.to_path_buf(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn test_launch_checkpoint_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = script_spec(tmp.path(), "#!/bin/sh\nsleep 60\n", 8000).await;
        spec.checkpoint = PathBuf::from("/definitely/not/a/checkpoint");

        let err = launch(&spec, tmp.path()).await.unwrap_err();
        assert!(matches!(err, DeployError::CheckpointMissing(_)));
    }

    #[tokio::test]
    async fn test_stop_after_launch_is_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = script_spec(tmp.path(), "#!/bin/sh\nwhile :; do sleep 1; done\n", 8000).await;

        let handle = launch(&spec, tmp.path()).await.expect("should spawn");
        let stopped = handle.stop(Duration::from_secs(5)).await;
        tokio_test::assert_ok!(stopped);
    }

    #[tokio::test]
    async fn test_wait_ready_detects_early_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = script_spec(
            tmp.path(),
            "#!/bin/sh\necho 'failed to bind port' >&2\nexit 7\n",
            8000,
        )
        .await;

        let mut handle = launch(&spec, tmp.path()).await.expect("should spawn");
        // Give the script a moment to exit.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client = EndpointClient::new().unwrap();
        let err = handle
            .wait_ready(&client, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            DeployError::EarlyExit { code, log_tail } => {
                assert_eq!(code, Some(7));
                assert!(log_tail.contains("failed to bind port"));
            }
            other => panic!("expected EarlyExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_ready_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        // Child stays alive but never serves; port 9 refuses connections.
        let spec = script_spec(tmp.path(), "#!/bin/sh\nwhile :; do sleep 1; done\n", 9).await;

        let mut handle = launch(&spec, tmp.path()).await.expect("should spawn");
        let client = EndpointClient::new().unwrap();
        let err = handle
            .wait_ready(&client, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ReadyTimeout(_)));

        let _ = handle.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_wait_ready_success() {
        // Stand in for the serving process's HTTP side with a local listener
        // on an ephemeral port; the child itself just stays alive.
        let app = axum::Router::new().route(
            "/health",
            axum::routing::get(|| async { axum::Json(serde_json::json!({"status": "ok"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let tmp = tempfile::tempdir().unwrap();
        let spec = script_spec(tmp.path(), "#!/bin/sh\nwhile :; do sleep 1; done\n", port).await;

        let mut handle = launch(&spec, tmp.path()).await.expect("should spawn");
        let client = EndpointClient::new().unwrap();
        handle
            .wait_ready(&client, Duration::from_secs(5))
            .await
            .expect("should become ready");

        let _ = handle.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_drop_without_stop_does_not_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = script_spec(tmp.path(), "#!/bin/sh\nwhile :; do sleep 1; done\n", 8000).await;
        let handle = launch(&spec, tmp.path()).await.expect("should spawn");
        drop(handle);
    }

    #[test]
    fn test_spec_base_url_matches_config_url() {
        let mut config = Config::from_env();
        config.server_host = "127.0.0.1".to_string();
        config.server_port = 8123;
        let spec = ServerSpec::from_config(&config, Path::new("/models/ckpt"));
        assert_eq!(spec.base_url(), config.server_base_url());
    }
}
