//! Single health check against a backend's model listing endpoint.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    data_connector::{ServerId, ServerRecord},
    observability::metrics::GatewayMetrics,
};

pub const HEALTH_CHECK_PATH: &str = "/v1/models";

/// Non-200 bodies are truncated to this many characters in error messages.
const ERROR_BODY_LIMIT: usize = 200;

/// Outcome of one probe. Carries no registry side effects.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub server_id: ServerId,
    pub is_healthy: bool,
    pub latency_ms: u64,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HealthProber {
    client: Client,
}

impl HealthProber {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn probe_server(&self, server: &ServerRecord, timeout: Duration) -> HealthResult {
        self.probe(
            server.id,
            &server.endpoint_url,
            server.api_key.as_deref(),
            timeout,
        )
        .await
    }

    /// Healthy only on HTTP 200 with a JSON object body.
    pub async fn probe(
        &self,
        server_id: ServerId,
        endpoint_url: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> HealthResult {
        let url = format!("{}{}", endpoint_url.trim_end_matches('/'), HEALTH_CHECK_PATH);
        let start = Instant::now();

        let outcome = self.check(&url, api_key, timeout).await;
        let elapsed = start.elapsed();
        let latency_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        GatewayMetrics::record_probe(outcome.is_ok(), elapsed);
        match &outcome {
            Ok(()) => debug!(server_id = %server_id, latency_ms, "Health probe succeeded"),
            Err(reason) => debug!(server_id = %server_id, latency_ms, %reason, "Health probe failed"),
        }

        HealthResult {
            server_id,
            is_healthy: outcome.is_ok(),
            latency_ms,
            error_message: outcome.err(),
            checked_at: Utc::now(),
        }
    }

    async fn check(&self, url: &str, api_key: Option<&str>, timeout: Duration) -> Result<(), String> {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| describe_request_error(&e, timeout))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| describe_request_error(&e, timeout))?;

        if status != StatusCode::OK {
            let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(format!("HTTP {}: {}", status.as_u16(), snippet));
        }

        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(_)) => Ok(()),
            Ok(_) => Err("Invalid JSON response: expected a JSON object".to_string()),
            Err(e) => Err(format!("Invalid JSON response: {e}")),
        }
    }
}

fn describe_request_error(error: &reqwest::Error, timeout: Duration) -> String {
    if error.is_timeout() {
        format!("Request timed out after {} seconds", timeout.as_secs_f64())
    } else {
        format!("Request error: {error}")
    }
}
