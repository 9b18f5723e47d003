use std::path::Path;
use tracing::{info, warn};

/// Remove a run's output directory.
pub async fn remove_run_dir(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        warn!("Failed to cleanup {}: {}", path.display(), e);
    }
}

/// Send a signal to every process in a process group (best-effort).
pub async fn signal_process_group(pgid: u32, signal: &str) {
    let _ = tokio::process::Command::new("kill")
        .args([&format!("-{}", signal), &format!("-{}", pgid)])
        .output()
        .await;
}

/// Scan the output base for stale run directories older than max_age_secs.
pub async fn reap_stale_runs(base: &Path, max_age_secs: u64) {
    let mut entries = match tokio::fs::read_dir(base).await {
        Ok(e) => e,
        Err(_) => return,
    };

    let now = std::time::SystemTime::now();
    let mut reaped = 0u32;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => continue,
        };
        let modified = match metadata.modified() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age.as_secs() > max_age_secs {
            remove_run_dir(&path).await;
            reaped += 1;
        }
    }

    if reaped > 0 {
        info!("Reaped {} stale run directories", reaped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_run_dir_nonexistent() {
        remove_run_dir(Path::new("/tmp/nonexistent_test_dir_xyz")).await;
        // should not panic
    }

    #[tokio::test]
    async fn test_remove_run_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("run-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("results.json"), "{}").await.unwrap();
        assert!(dir.exists());
        remove_run_dir(&dir).await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_reap_skips_fresh_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("run-fresh");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        reap_stale_runs(tmp.path(), 3600).await;
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn test_signal_process_group_invalid_pgid() {
        // Signalling a nonexistent group must not error out of the helper.
        signal_process_group(u32::MAX, "TERM").await;
    }
}
