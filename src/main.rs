mod auth;
mod cleanup;
mod config;
mod deploy;
mod endpoint;
mod executor;
mod handlers;
mod harness;
mod metrics;
mod runs;
mod ws;

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelbench=info".parse().unwrap()),
        )
        .init();

    let config = Arc::new(config::Config::from_env());
    config.print_banner();

    // Create output base directory
    tokio::fs::create_dir_all(&config.output_base)
        .await
        .expect("Failed to create output directory");

    let runs = Arc::new(runs::RunManager::new(config.run_ttl_secs));
    let metrics_store = metrics::Metrics::new();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs));
    let executor = Arc::new(executor::Executor::new(
        config.clone(),
        runs.clone(),
        metrics_store.clone(),
    ));

    let state = Arc::new(handlers::AppState {
        config: config.clone(),
        runs: runs.clone(),
        metrics: metrics_store,
        executor,
        semaphore,
        started_at: chrono::Utc::now(),
    });

    let app = handlers::router(state);
    let addr = format!("0.0.0.0:{}", config.port);

    // Run reaper
    let runs_reaper = runs.clone();
    tokio::spawn(async move {
        runs_reaper.reaper_loop().await;
    });

    // Stale dir reaper
    let output_base = config.output_base.clone();
    let ttl = config.run_ttl_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup::reap_stale_runs(&output_base, ttl).await;
        }
    });

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

    // Graceful shutdown on SIGTERM
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        info!("Shutdown signal received, draining...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();

    info!("Shutdown complete");
}
