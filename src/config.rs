use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SERVER_BIN: &str = "model-server";
const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 8000;
const DEFAULT_HARNESS_BIN: &str = "eval-harness";
const DEFAULT_READY_TIMEOUT: u64 = 300;
const DEFAULT_EVAL_TIMEOUT: u64 = 3600;
const DEFAULT_STOP_GRACE: u64 = 10;
const DEFAULT_RUN_TTL: u64 = 7200;
const DEFAULT_MAX_CONCURRENT: usize = 1;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const DEFAULT_OUTPUT_BASE: &str = "/tmp/modelbench";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub auth_token: Option<String>,
    pub server_bin: String,
    pub server_host: String,
    pub server_port: u16,
    pub harness_bin: String,
    pub ready_timeout_secs: u64,
    pub eval_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub run_ttl_secs: u64,
    pub max_concurrent_runs: usize,
    pub max_output_bytes: usize,
    pub output_base: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            auth_token: std::env::var("AUTH_TOKEN").ok(),
            server_bin: std::env::var("SERVER_BIN").unwrap_or_else(|_| DEFAULT_SERVER_BIN.into()),
            server_host: std::env::var("SERVER_HOST")
                .unwrap_or_else(|_| DEFAULT_SERVER_HOST.into()),
            server_port: env_parse("SERVER_PORT", DEFAULT_SERVER_PORT),
            harness_bin: std::env::var("HARNESS_BIN")
                .unwrap_or_else(|_| DEFAULT_HARNESS_BIN.into()),
            ready_timeout_secs: env_parse("READY_TIMEOUT_SECS", DEFAULT_READY_TIMEOUT),
            eval_timeout_secs: env_parse("EVAL_TIMEOUT_SECS", DEFAULT_EVAL_TIMEOUT),
            stop_grace_secs: env_parse("STOP_GRACE_SECS", DEFAULT_STOP_GRACE),
            run_ttl_secs: env_parse("RUN_TTL_SECS", DEFAULT_RUN_TTL),
            max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS", DEFAULT_MAX_CONCURRENT),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", DEFAULT_MAX_OUTPUT_BYTES),
            output_base: PathBuf::from(
                std::env::var("OUTPUT_BASE").unwrap_or_else(|_| DEFAULT_OUTPUT_BASE.into()),
            ),
        }
    }

    /// Base URL of the serving process. The launcher bind address and the
    /// driver target both derive from this one value.
    pub fn server_base_url(&self) -> String {
        format!("http://{}:{}", self.server_host, self.server_port)
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║             modelbench v{}                    ║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Port:              {:<28}║", self.port);
        tracing::info!("║  Auth:              {:<28}║", match self.auth_token {
            Some(ref t) => format!("enabled ({})", crate::auth::token_fingerprint(t)),
            None => "disabled".to_string(),
        });
        tracing::info!("║  Server binary:     {:<28}║", self.server_bin);
        tracing::info!("║  Server URL:        {:<28}║", self.server_base_url());
        tracing::info!("║  Harness binary:    {:<28}║", self.harness_bin);
        tracing::info!("║  Ready timeout:     {:<25}s ║", self.ready_timeout_secs);
        tracing::info!("║  Eval timeout:      {:<25}s ║", self.eval_timeout_secs);
        tracing::info!("║  Stop grace:        {:<25}s ║", self.stop_grace_secs);
        tracing::info!("║  Run TTL:           {:<25}s ║", self.run_ttl_secs);
        tracing::info!("║  Max concurrent:    {:<28}║", self.max_concurrent_runs);
        tracing::info!("║  Output base:       {:<28}║", self.output_base.display());
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.server_port, DEFAULT_SERVER_PORT);
        assert_eq!(cfg.max_concurrent_runs, DEFAULT_MAX_CONCURRENT);
        assert_eq!(cfg.server_bin, DEFAULT_SERVER_BIN);
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_parse::<u16>("NONEXISTENT_VAR_XYZ", 42), 42);
    }

    #[test]
    fn test_server_base_url_from_single_value() {
        let mut cfg = Config::from_env();
        cfg.server_host = "10.0.0.5".to_string();
        cfg.server_port = 9000;
        assert_eq!(cfg.server_base_url(), "http://10.0.0.5:9000");
    }
}
