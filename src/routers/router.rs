//! Request-time orchestration: pick a healthy server, forward, fail over.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use http::{StatusCode, header::CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::streaming::{StreamingRoute, spawn_relay};
use crate::{
    data_connector::{RegistryError, RegistryStorage, ServerRecord},
    observability::metrics::{GatewayMetrics, UNROUTED_MODEL},
    policies::LoadBalancingPolicy,
};

pub const NO_HEALTHY_SERVERS: &str = "No healthy servers available for this model";

/// Final outcome of a buffered routing call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResult {
    pub status: u16,
    pub body: Value,
    pub error_message: Option<String>,
    pub registration_id: Option<String>,
}

impl RouteResult {
    fn success(body: Value, registration_id: String) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            body,
            error_message: None,
            registration_id: Some(registration_id),
        }
    }

    fn failure(status: StatusCode, message: String) -> Self {
        Self {
            status: status.as_u16(),
            body: json!({}),
            error_message: Some(message),
            registration_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }
}

/// Streaming routing failures, all raised before the first chunk.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("No healthy servers available for this model")]
    NoHealthyServers { model: String },

    #[error("Registry unavailable: {0}")]
    Registry(#[from] RegistryError),

    #[error("{message}")]
    Upstream {
        status: u16,
        message: String,
        registration_id: String,
    },
}

impl RouteError {
    pub fn status(&self) -> u16 {
        match self {
            RouteError::NoHealthyServers { .. } => StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            RouteError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            RouteError::Upstream { status, .. } => *status,
        }
    }
}

/// One failed forwarding attempt.
#[derive(Debug)]
struct AttemptFailure {
    status: StatusCode,
    message: String,
    kind: &'static str,
}

impl AttemptFailure {
    fn from_reqwest(error: &reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                message: format!("Request timeout after {}ms", timeout.as_millis()),
                kind: "timeout",
            }
        } else {
            Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: format!("Request error: {error}"),
                kind: "transport",
            }
        }
    }

    fn backend_status(status: StatusCode) -> Self {
        Self {
            status,
            message: format!("Backend returned status {}", status.as_u16()),
            kind: "backend_status",
        }
    }
}

pub struct RequestRouter {
    client: Client,
    registry: Arc<dyn RegistryStorage>,
    policy: Arc<dyn LoadBalancingPolicy>,
    request_timeout: Duration,
}

impl RequestRouter {
    pub fn new(
        client: Client,
        registry: Arc<dyn RegistryStorage>,
        policy: Arc<dyn LoadBalancingPolicy>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            registry,
            policy,
            request_timeout,
        }
    }

    /// Active, healthy servers for a model, least recently used first.
    pub async fn list_healthy_servers(
        &self,
        model_name: &str,
    ) -> Result<Vec<ServerRecord>, RegistryError> {
        self.registry.list_healthy_servers(model_name).await
    }

    /// Forwards a JSON request, failing over to another healthy server on any
    /// non-200 outcome until `max_retries` attempts are spent.
    pub async fn route_request(
        &self,
        model_name: &str,
        endpoint_path: &str,
        body: &Value,
        max_retries: u32,
    ) -> RouteResult {
        let start = Instant::now();

        let mut candidates = match self.list_healthy_servers(model_name).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(model = model_name, error = %e, "Failed to load healthy servers");
                GatewayMetrics::record_request(UNROUTED_MODEL, "registry_error");
                return RouteResult::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Registry unavailable: {e}"),
                );
            }
        };

        if candidates.is_empty() {
            warn!(model = model_name, "No healthy servers available");
            GatewayMetrics::record_request(UNROUTED_MODEL, "no_capacity");
            return RouteResult::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                NO_HEALTHY_SERVERS.to_string(),
            );
        }

        let max_attempts = max_retries.max(1);
        let mut attempts = 0;
        let mut last_error = String::from("no attempt was made");

        while attempts < max_attempts && !candidates.is_empty() {
            let Some(idx) = self.policy.select_server(model_name, &candidates) else {
                break;
            };
            let server = candidates.remove(idx);
            attempts += 1;
            if attempts > 1 {
                GatewayMetrics::record_retry(model_name);
            }

            debug!(
                model = model_name,
                registration_id = %server.registration_id,
                attempt = attempts,
                "Forwarding request"
            );

            match self.forward(&server, endpoint_path, body).await {
                Ok(response_body) => {
                    if let Err(e) = self.registry.record_request_success(server.id).await {
                        warn!(
                            registration_id = %server.registration_id,
                            error = %e,
                            "Failed to record request success"
                        );
                    }
                    GatewayMetrics::record_request(model_name, "success");
                    GatewayMetrics::record_request_duration(start.elapsed());
                    return RouteResult::success(response_body, server.registration_id);
                }
                Err(failure) => {
                    warn!(
                        model = model_name,
                        registration_id = %server.registration_id,
                        attempt = attempts,
                        status = failure.status.as_u16(),
                        error = %failure.message,
                        "Forwarding attempt failed, marking server unhealthy"
                    );
                    GatewayMetrics::record_upstream_failure(model_name, failure.kind);
                    self.mark_unhealthy(&server, &failure.message).await;
                    last_error = failure.message;
                }
            }
        }

        info!(
            model = model_name,
            attempts,
            last_error = %last_error,
            "All servers failed"
        );
        GatewayMetrics::record_request(model_name, "exhausted");
        GatewayMetrics::record_request_duration(start.elapsed());
        RouteResult::failure(
            StatusCode::GATEWAY_TIMEOUT,
            format!("All servers failed. Last error: {last_error}"),
        )
    }

    /// Opens a stream on one selected server. No failover: a failed start is
    /// reported to the caller and the server is marked unhealthy.
    pub async fn route_streaming_request(
        &self,
        model_name: &str,
        endpoint_path: &str,
        body: &Value,
    ) -> Result<StreamingRoute, RouteError> {
        let candidates = self.list_healthy_servers(model_name).await?;
        let Some(idx) = self.policy.select_server(model_name, &candidates) else {
            warn!(model = model_name, "No healthy servers available for streaming");
            GatewayMetrics::record_stream_outcome(UNROUTED_MODEL, "no_capacity");
            return Err(RouteError::NoHealthyServers {
                model: model_name.to_string(),
            });
        };
        let server = candidates[idx].clone();

        let url = format!("{}{}", server.endpoint_url, endpoint_path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &server.api_key {
            request = request.bearer_auth(key);
        }

        let started = tokio::time::timeout(self.request_timeout, request.send()).await;
        let response = match started {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let failure = AttemptFailure::from_reqwest(&e, self.request_timeout);
                return Err(self.fail_stream_start(model_name, &server, failure).await);
            }
            Err(_) => {
                let failure = AttemptFailure {
                    status: StatusCode::GATEWAY_TIMEOUT,
                    message: format!(
                        "Request timeout after {}ms",
                        self.request_timeout.as_millis()
                    ),
                    kind: "timeout",
                };
                return Err(self.fail_stream_start(model_name, &server, failure).await);
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            let failure = AttemptFailure::backend_status(status);
            return Err(self.fail_stream_start(model_name, &server, failure).await);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        info!(
            model = model_name,
            registration_id = %server.registration_id,
            "Streaming response started"
        );
        let stream = spawn_relay(response, &server, self.registry.clone(), self.request_timeout);

        Ok(StreamingRoute {
            server,
            status: status.as_u16(),
            content_type,
            stream,
        })
    }

    async fn forward(
        &self,
        server: &ServerRecord,
        endpoint_path: &str,
        body: &Value,
    ) -> Result<Value, AttemptFailure> {
        let url = format!("{}{}", server.endpoint_url, endpoint_path);
        let mut request = self
            .client
            .post(&url)
            .json(body)
            .timeout(self.request_timeout);
        if let Some(key) = &server.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AttemptFailure::from_reqwest(&e, self.request_timeout))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AttemptFailure::backend_status(status));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AttemptFailure::from_reqwest(&e, self.request_timeout))?;

        Ok(serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| json!({ "text": String::from_utf8_lossy(&bytes) })))
    }

    async fn mark_unhealthy(&self, server: &ServerRecord, message: &str) {
        if let Err(e) = self
            .registry
            .record_health_result(server.id, false, Some(message))
            .await
        {
            warn!(
                registration_id = %server.registration_id,
                error = %e,
                "Failed to record forwarding failure"
            );
        }
    }

    async fn fail_stream_start(
        &self,
        model_name: &str,
        server: &ServerRecord,
        failure: AttemptFailure,
    ) -> RouteError {
        warn!(
            model = model_name,
            registration_id = %server.registration_id,
            status = failure.status.as_u16(),
            error = %failure.message,
            "Failed to start stream, marking server unhealthy"
        );
        GatewayMetrics::record_upstream_failure(model_name, failure.kind);
        GatewayMetrics::record_stream_outcome(model_name, "start_failed");
        self.mark_unhealthy(server, &failure.message).await;
        RouteError::Upstream {
            status: failure.status.as_u16(),
            message: failure.message,
            registration_id: server.registration_id.clone(),
        }
    }
}
