use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct Metrics {
    pub runs_total: AtomicU64,
    pub runs_active: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub servers_started: AtomicU64,
    pub server_failures: AtomicU64,
    pub duration_sum_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runs_total: AtomicU64::new(0),
            runs_active: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_cancelled: AtomicU64::new(0),
            servers_started: AtomicU64::new(0),
            server_failures: AtomicU64::new(0),
            duration_sum_ms: AtomicU64::new(0),
        })
    }

    pub fn start_run(&self) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        self.runs_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_run(&self, succeeded: bool, duration_ms: u64) {
        self.runs_active.fetch_sub(1, Ordering::Relaxed);
        self.duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        if succeeded {
            self.runs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cancel_run(&self, duration_ms: u64) {
        self.runs_active.fetch_sub(1, Ordering::Relaxed);
        self.runs_cancelled.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_server_start(&self) {
        self.servers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_server_failure(&self) {
        self.server_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let runs_total = self.runs_total.load(Ordering::Relaxed);
        let runs_active = self.runs_active.load(Ordering::Relaxed);
        let runs_completed = self.runs_completed.load(Ordering::Relaxed);
        let runs_failed = self.runs_failed.load(Ordering::Relaxed);
        let runs_cancelled = self.runs_cancelled.load(Ordering::Relaxed);
        let servers_started = self.servers_started.load(Ordering::Relaxed);
        let server_failures = self.server_failures.load(Ordering::Relaxed);
        let dur_sum = self.duration_sum_ms.load(Ordering::Relaxed);

        format!(
            "# HELP modelbench_runs_total Total evaluation runs submitted.\n\
             # TYPE modelbench_runs_total counter\n\
             modelbench_runs_total {}\n\
             # HELP modelbench_runs_active Currently running evaluations.\n\
             # TYPE modelbench_runs_active gauge\n\
             modelbench_runs_active {}\n\
             # HELP modelbench_runs_completed Runs that finished with results.\n\
             # TYPE modelbench_runs_completed counter\n\
             modelbench_runs_completed {}\n\
             # HELP modelbench_runs_failed Runs that ended in an error.\n\
             # TYPE modelbench_runs_failed counter\n\
             modelbench_runs_failed {}\n\
             # HELP modelbench_runs_cancelled Runs cancelled before completion.\n\
             # TYPE modelbench_runs_cancelled counter\n\
             modelbench_runs_cancelled {}\n\
             # HELP modelbench_servers_started Serving processes launched.\n\
             # TYPE modelbench_servers_started counter\n\
             modelbench_servers_started {}\n\
             # HELP modelbench_server_failures Serving processes that failed to become ready.\n\
             # TYPE modelbench_server_failures counter\n\
             modelbench_server_failures {}\n\
             # HELP modelbench_duration_ms_sum Sum of run durations in ms.\n\
             # TYPE modelbench_duration_ms_sum counter\n\
             modelbench_duration_ms_sum {}\n",
            runs_total,
            runs_active,
            runs_completed,
            runs_failed,
            runs_cancelled,
            servers_started,
            server_failures,
            dur_sum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_lifecycle() {
        let m = Metrics::new();
        m.start_run();
        assert_eq!(m.runs_active.load(Ordering::Relaxed), 1);
        assert_eq!(m.runs_total.load(Ordering::Relaxed), 1);

        m.finish_run(true, 5000);
        assert_eq!(m.runs_active.load(Ordering::Relaxed), 0);
        assert_eq!(m.runs_completed.load(Ordering::Relaxed), 1);
        assert_eq!(m.runs_failed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_failed_run_counted_separately() {
        let m = Metrics::new();
        m.start_run();
        m.finish_run(false, 100);
        assert_eq!(m.runs_failed.load(Ordering::Relaxed), 1);
        assert_eq!(m.runs_completed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_prometheus_output() {
        let m = Metrics::new();
        m.start_run();
        m.record_server_start();
        m.finish_run(true, 1234);
        let out = m.render_prometheus();
        assert!(out.contains("modelbench_runs_total 1"));
        assert!(out.contains("modelbench_servers_started 1"));
        assert!(out.contains("modelbench_duration_ms_sum 1234"));
    }
}
