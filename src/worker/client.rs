//! HTTP client for the upstream worker (spec.md §6 "HTTP — upstream").
//!
//! Mirrors `McpBridge` from the teacher's SSE bridge: a pooled reqwest
//! client, one timeout per call site, and errors mapped to a response
//! value rather than propagated raw.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::GatewayError;

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(5);
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of forwarding one request to the worker.
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub body: Value,
}

pub struct WorkerClient {
    client: Client,
    base_url: String,
}

impl WorkerClient {
    pub fn new(base_url: String) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(GatewayError::Upstream)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Forward one chat-completions body. On transport/parse failure the
    /// caller synthesizes a 500 -- this only returns `Err` for transport
    /// failures so the caller can distinguish "no response" from
    /// "worker responded, non-JSON".
    pub async fn forward_chat_completions(&self, body: &Value) -> reqwest::Result<ForwardedResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(CHAT_TIMEOUT)
            .json(body)
            .send()
            .await?;
        self.into_forwarded(response).await
    }

    /// Proxy `GET /v1/models` verbatim.
    pub async fn get_models(&self) -> reqwest::Result<ForwardedResponse> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).timeout(MODELS_TIMEOUT).send().await?;
        self.into_forwarded(response).await
    }

    /// `GET /v1/models` with a short timeout; all errors collapse to
    /// `false` per spec.md §4.B (never raised).
    pub async fn healthcheck(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self.client.get(&url).timeout(HEALTHCHECK_TIMEOUT).send().await {
            Ok(resp) => {
                let ok = resp.status() == StatusCode::OK;
                debug!(healthy = ok, "worker healthcheck");
                ok
            }
            Err(e) => {
                warn!(error = %e, "worker healthcheck failed");
                false
            }
        }
    }

    async fn into_forwarded(&self, response: reqwest::Response) -> reqwest::Result<ForwardedResponse> {
        let status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if !is_json {
            return Ok(ForwardedResponse {
                status,
                body: Value::Object(Default::default()),
            });
        }

        let body = response.json::<Value>().await.unwrap_or_else(|e| {
            warn!(error = %e, "worker returned malformed JSON body");
            Value::Object(Default::default())
        });

        Ok(ForwardedResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn forwards_json_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "x"})))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).unwrap();
        let resp = client
            .forward_chat_completions(&json!({"max_tokens": 200}))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, json!({"id": "x"}));
    }

    #[tokio::test]
    async fn healthcheck_false_on_non_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).unwrap();
        assert!(!client.healthcheck().await);
    }

    #[tokio::test]
    async fn healthcheck_false_on_connection_refused() {
        let client = WorkerClient::new("http://127.0.0.1:1".to_string()).unwrap();
        assert!(!client.healthcheck().await);
    }

    #[tokio::test]
    async fn non_json_upstream_response_becomes_empty_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json").insert_header("content-type", "text/plain"))
            .mount(&server)
            .await;

        let client = WorkerClient::new(server.uri()).unwrap();
        let resp = client.get_models().await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, json!({}));
    }
}
