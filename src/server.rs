use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};

use crate::{
    app_context::AppContext,
    config::GatewayConfig,
    core::RegistrationError,
    data_connector::{HealthStatus, NewServer, ServerFilter, ServerUpdate},
    middleware::{self, AdminAuthConfig},
    observability::{
        logging::{self, LoggingConfig},
        metrics,
    },
    routers::{RouteError, RouteResult, error},
};

pub const SERVER_ID_HEADER: &str = "x-gateway-server-id";

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const COMPLETIONS_PATH: &str = "/v1/completions";

// ============================================================================
// Public handlers
// ============================================================================

async fn health(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(json!({
        "status": "ok",
        "health_monitor_running": ctx.monitor.is_running(),
    }))
    .into_response()
}

async fn list_models(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.registry.list_models().await {
        Ok(models) => {
            let created = Utc::now().timestamp();
            let data: Vec<Value> = models
                .into_iter()
                .map(|id| {
                    json!({
                        "id": id,
                        "object": "model",
                        "created": created,
                        "owned_by": "system",
                    })
                })
                .collect();
            Json(json!({ "object": "list", "data": data })).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to list models");
            error::internal_error("registry_unavailable", format!("Registry unavailable: {e}"))
        }
    }
}

async fn v1_chat_completions(State(ctx): State<Arc<AppContext>>, body: Bytes) -> Response {
    route_inference(&ctx, CHAT_COMPLETIONS_PATH, &body).await
}

async fn v1_completions(State(ctx): State<Arc<AppContext>>, body: Bytes) -> Response {
    route_inference(&ctx, COMPLETIONS_PATH, &body).await
}

async fn route_inference(ctx: &AppContext, path: &str, raw: &[u8]) -> Response {
    let body: Value = match serde_json::from_slice(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => return error::bad_request("invalid_request", "Request body must be a JSON object"),
        Err(e) => return error::bad_request("invalid_json", format!("Invalid JSON body: {e}")),
    };
    let Some(model) = body.get("model").and_then(Value::as_str).map(str::to_string) else {
        return error::bad_request("missing_model", "Request must include a string 'model' field");
    };

    if body.get("stream").and_then(Value::as_bool) == Some(true) {
        return stream_inference(ctx, &model, path, &body).await;
    }

    let result = ctx
        .router
        .route_request(&model, path, &body, ctx.config.routing.max_retry_attempts)
        .await;
    buffered_response(ctx, result)
}

fn buffered_response(ctx: &AppContext, result: RouteResult) -> Response {
    if !result.is_success() {
        let status =
            StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match status {
            StatusCode::SERVICE_UNAVAILABLE => "no_healthy_servers",
            StatusCode::GATEWAY_TIMEOUT => "all_servers_failed",
            _ => "internal_error",
        };
        return error::create_error(
            status,
            code,
            result.error_message.unwrap_or_else(|| "Unknown error".to_string()),
        );
    }

    let mut response = (StatusCode::OK, Json(result.body)).into_response();
    if ctx.config.include_server_id_header {
        attach_server_id(&mut response, result.registration_id.as_deref());
    }
    response
}

async fn stream_inference(ctx: &AppContext, model: &str, path: &str, body: &Value) -> Response {
    match ctx.router.route_streaming_request(model, path, body).await {
        Ok(route) => {
            let content_type = route
                .content_type
                .as_deref()
                .and_then(|ct| HeaderValue::from_str(ct).ok())
                .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));
            let mut response = Response::new(Body::from_stream(route.stream));
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, content_type);
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            if ctx.config.include_server_id_header {
                attach_server_id(&mut response, Some(&route.server.registration_id));
            }
            response
        }
        Err(e @ RouteError::NoHealthyServers { .. }) => {
            error::create_error(StatusCode::SERVICE_UNAVAILABLE, "no_healthy_servers", e.to_string())
        }
        Err(e @ RouteError::Registry(_)) => {
            error::internal_error("registry_unavailable", e.to_string())
        }
        Err(RouteError::Upstream {
            message,
            registration_id,
            ..
        }) => {
            let mut response = error::create_error(StatusCode::BAD_GATEWAY, "upstream_error", message);
            if ctx.config.include_server_id_header {
                attach_server_id(&mut response, Some(&registration_id));
            }
            response
        }
    }
}

fn attach_server_id(response: &mut Response, registration_id: Option<&str>) {
    if let Some(value) = registration_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(SERVER_ID_HEADER, value);
    }
}

// ============================================================================
// Admin handlers
// ============================================================================

fn registration_error(e: RegistrationError) -> Response {
    match e {
        RegistrationError::InvalidUrl(inner) => error::bad_request("invalid_url", inner.to_string()),
        RegistrationError::InvalidModelName => {
            error::bad_request("invalid_model_name", "Model name must not be empty")
        }
        RegistrationError::NotFound { registration_id } => error::not_found(
            "server_not_found",
            format!("Server not found: {registration_id}"),
        ),
        RegistrationError::Registry(inner) => {
            error!(error = %inner, "Registry operation failed");
            error::internal_error("registry_error", inner.to_string())
        }
    }
}

async fn register_server(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<NewServer>,
) -> Response {
    match ctx.registration.register_server(request).await {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(e) => registration_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ListServersQuery {
    model_name: Option<String>,
    health_status: Option<String>,
    #[serde(default)]
    include_inactive: bool,
}

async fn list_servers(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListServersQuery>,
) -> Response {
    let health_status = match query.health_status.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<HealthStatus>() {
            Ok(status) => Some(status),
            Err(_) => {
                return error::bad_request(
                    "invalid_health_status",
                    format!("Unknown health status '{raw}'"),
                );
            }
        },
    };
    let filter = ServerFilter {
        model_name: query.model_name,
        health_status,
        include_inactive: query.include_inactive,
    };

    match ctx.registry.list_servers(&filter).await {
        Ok(servers) => Json(json!({ "total": servers.len(), "servers": servers })).into_response(),
        Err(e) => error::internal_error("registry_error", e.to_string()),
    }
}

async fn update_server(
    State(ctx): State<Arc<AppContext>>,
    Path(registration_id): Path<String>,
    Json(update): Json<ServerUpdate>,
) -> Response {
    match ctx.registration.update_server(&registration_id, update).await {
        Ok(server) => Json(server).into_response(),
        Err(e) => registration_error(e),
    }
}

async fn deregister_server(
    State(ctx): State<Arc<AppContext>>,
    Path(registration_id): Path<String>,
) -> Response {
    match ctx.registration.deregister_server(&registration_id).await {
        Ok(true) => Json(json!({
            "registration_id": registration_id,
            "deregistered": true,
        }))
        .into_response(),
        Ok(false) => error::not_found(
            "server_not_found",
            format!("Server not found: {registration_id}"),
        ),
        Err(e) => registration_error(e),
    }
}

async fn registry_stats(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.registry.stats().await {
        Ok(stats) => Json(json!({
            "total_servers": stats.total_servers,
            "total_models": stats.total_models,
            "servers_by_health": {
                "healthy": stats.healthy,
                "unhealthy": stats.unhealthy,
                "unknown": stats.unknown,
            },
            "health_monitor_running": ctx.monitor.is_running(),
        }))
        .into_response(),
        Err(e) => error::internal_error("registry_error", e.to_string()),
    }
}

async fn monitor_status(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.monitor.status()).into_response()
}

async fn run_health_check(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.monitor.run_health_check_cycle().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!(error = %e, "Manual health check cycle failed");
            error::internal_error("registry_error", e.to_string())
        }
    }
}

// ============================================================================
// App assembly
// ============================================================================

pub fn build_app(context: Arc<AppContext>) -> Router {
    let auth = AdminAuthConfig {
        api_key: context.config.admin_api_key.clone(),
    };
    let max_payload_size = context.config.max_payload_size;

    let admin_routes = Router::new()
        .route("/admin/register", post(register_server))
        .route("/admin/servers", get(list_servers))
        .route(
            "/admin/servers/{registration_id}",
            put(update_server).delete(deregister_server),
        )
        .route("/admin/stats", get(registry_stats))
        .route("/admin/health-monitor", get(monitor_status))
        .route("/admin/health-monitor/run", post(run_health_check))
        .route_layer(axum::middleware::from_fn_with_state(
            auth,
            middleware::admin_auth_middleware,
        ));

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route(CHAT_COMPLETIONS_PATH, post(v1_chat_completions))
        .route(COMPLETIONS_PATH, post(v1_completions));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(max_payload_size))
        .with_state(context)
}

pub async fn startup(config: GatewayConfig) -> anyhow::Result<()> {
    static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

    let _log_guard = if !LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        Some(logging::init_logging(LoggingConfig {
            level: config
                .log_level
                .as_deref()
                .and_then(logging::parse_level)
                .unwrap_or(tracing::Level::INFO),
            json_format: config.json_logs,
            log_dir: config.log_dir.clone(),
            ..Default::default()
        }))
    } else {
        None
    };

    if let Some(metrics_config) = &config.metrics {
        metrics::start_prometheus(metrics_config)?;
        info!(
            host = %metrics_config.host,
            port = metrics_config.port,
            "Prometheus exporter listening"
        );
    }

    info!(
        "Starting gateway on {}:{} | round_robin: {} | retries: {} | health interval: {}s",
        config.host,
        config.port,
        config.routing.round_robin_enabled,
        config.routing.max_retry_attempts,
        config.health_check.interval().as_secs()
    );
    if config.admin_api_key.is_none() {
        warn!("No admin API key configured, admin routes are disabled");
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    let context = Arc::new(AppContext::from_config(config).await?);
    context.monitor.start();

    let app = build_app(context.clone());
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Gateway ready on {}", bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    context.monitor.stop().await;
    served?;
    info!("Gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
