use anyhow::{Context, Result};
use tracing::debug;

use crate::harness::config::{ApiKind, EvaluationTarget};

const HEALTH_PATH: &str = "/health";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const SMOKE_MAX_TOKENS: u32 = 8;

/// Client for the serving process: the health probe plus the two well-known
/// completion paths.
pub struct EndpointClient {
    client: reqwest::Client,
}

impl EndpointClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client for serving endpoint")?;
        Ok(Self { client })
    }

    /// One readiness probe. Network errors and non-2xx answers both read as
    /// "not ready yet"; the caller owns the retry loop and its deadline.
    pub async fn is_healthy(&self, base_url: &str) -> bool {
        let url = format!("{}{}", base_url.trim_end_matches('/'), HEALTH_PATH);
        match self.client.get(&url).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if !ok {
                    debug!("Health probe {} returned HTTP {}", url, resp.status());
                }
                ok
            }
            Err(e) => {
                debug!("Health probe {} failed: {}", url, e);
                false
            }
        }
    }

    /// Send one short completion to the deployed endpoint. Used as a smoke
    /// check that the server actually answers on its advertised path before
    /// the harness is pointed at it.
    pub async fn smoke_completion(
        &self,
        target: &EvaluationTarget,
        model: &str,
        prompt: &str,
    ) -> Result<serde_json::Value> {
        let url = target.api_url();
        let body = completion_body(target.api, model, prompt, SMOKE_MAX_TOKENS);

        debug!("Smoke completion against {}", url);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach serving endpoint {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Serving endpoint returned HTTP {}: {}",
                status.as_u16(),
                &body[..body.len().min(500)]
            );
        }

        resp.json()
            .await
            .context("Failed to parse completion response")
    }
}

fn completion_body(api: ApiKind, model: &str, prompt: &str, max_tokens: u32) -> serde_json::Value {
    match api {
        ApiKind::Completions => serde_json::json!({
            "model": model,
            "prompt": prompt,
            "max_tokens": max_tokens,
        }),
        ApiKind::Chat => serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    #[test]
    fn test_client_creation() {
        assert!(EndpointClient::new().is_ok());
    }

    #[test]
    fn test_completion_body_shapes() {
        let body = completion_body(ApiKind::Completions, "ckpt", "2+2=", 8);
        assert_eq!(body["prompt"], "2+2=");
        assert!(body.get("messages").is_none());

        let body = completion_body(ApiKind::Chat, "ckpt", "2+2=", 8);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "2+2=");
        assert!(body.get("prompt").is_none());
    }

    async fn spawn_fake_server() -> String {
        let app = Router::new()
            .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
            .route(
                "/v1/completions",
                post(|Json(body): Json<serde_json::Value>| async move {
                    Json(serde_json::json!({
                        "model": body["model"],
                        "choices": [{"text": " 4"}],
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_is_healthy_against_live_server() {
        let base = spawn_fake_server().await;
        let client = EndpointClient::new().unwrap();
        assert!(client.is_healthy(&base).await);
    }

    #[tokio::test]
    async fn test_is_healthy_unreachable() {
        let client = EndpointClient::new().unwrap();
        // Port from the reserved block; nothing listens there.
        assert!(!client.is_healthy("http://127.0.0.1:9").await);
    }

    #[tokio::test]
    async fn test_smoke_completion_roundtrip() {
        let base = spawn_fake_server().await;
        let client = EndpointClient::new().unwrap();
        let target = EvaluationTarget::new(&base, ApiKind::Completions);

        let resp = client
            .smoke_completion(&target, "ckpt", "2+2=")
            .await
            .expect("completion should succeed");
        assert_eq!(resp["choices"][0]["text"], " 4");
    }

    #[tokio::test]
    async fn test_smoke_completion_unknown_path() {
        let base = spawn_fake_server().await;
        let client = EndpointClient::new().unwrap();
        // Chat path is not mounted on the fake server; the 404 must surface.
        let target = EvaluationTarget::new(&base, ApiKind::Chat);

        let err = client
            .smoke_completion(&target, "ckpt", "hello")
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("HTTP 404"));
    }
}
