mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{
    TEST_MODEL, add_healthy_server, mock_backend::{MockBackend, MockBackendConfig},
    new_registry, round_robin_router, wait_until,
};
use futures_util::StreamExt;
use inference_gateway::{
    data_connector::{HealthStatus, RegistryStorage},
    routers::{RouteError, StreamError},
};
use serde_json::json;

const CHAT: &str = "/v1/chat/completions";

fn stream_body() -> serde_json::Value {
    json!({
        "model": TEST_MODEL,
        "stream": true,
        "messages": [{"role": "user", "content": "hello"}]
    })
}

#[tokio::test]
async fn test_stream_relays_chunks_and_records_success() {
    let backend = MockBackend::healthy().await;
    let registry = new_registry();
    let server = add_healthy_server(&registry, TEST_MODEL, backend.url()).await;
    let before = server.last_successful_request_at;

    let router = round_robin_router(registry.clone(), Duration::from_secs(5));
    let route = router
        .route_streaming_request(TEST_MODEL, CHAT, &stream_body())
        .await
        .unwrap();
    assert_eq!(route.status, 200);
    assert_eq!(route.server.id, server.id);
    assert_eq!(route.content_type.as_deref(), Some("text/event-stream"));

    let items: Vec<_> = route.stream.collect().await;
    assert!(items.iter().all(Result::is_ok));
    let body: Vec<u8> = items
        .into_iter()
        .flat_map(|item| item.unwrap().to_vec())
        .collect();
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("\"content\":\"a\""));
    assert!(body.ends_with("data: [DONE]\n\n"));

    let recorded = wait_until(Duration::from_secs(2), || {
        let registry = registry.clone();
        async move {
            registry
                .get_server(server.id)
                .await
                .ok()
                .flatten()
                .is_some_and(|r| r.last_successful_request_at > before)
        }
    })
    .await;
    assert!(recorded);
}

#[tokio::test]
async fn test_mid_stream_failure_ends_with_error_and_no_failover() {
    let broken = MockBackend::start(MockBackendConfig {
        stream_chunks: vec!["chunk-1;".to_string(), "chunk-2;".to_string()],
        stream_fail_after_chunks: true,
        ..Default::default()
    })
    .await;
    let spare = MockBackend::healthy().await;

    let registry = new_registry();
    let server = add_healthy_server(&registry, TEST_MODEL, broken.url()).await;
    add_healthy_server(&registry, TEST_MODEL, spare.url()).await;

    let router = round_robin_router(registry.clone(), Duration::from_secs(5));
    let route = router
        .route_streaming_request(TEST_MODEL, CHAT, &stream_body())
        .await
        .unwrap();
    assert_eq!(route.server.id, server.id);

    let items: Vec<_> = route.stream.collect().await;
    let (last, data) = items.split_last().unwrap();

    let relayed: Vec<u8> = data
        .iter()
        .flat_map(|item| item.as_ref().unwrap().to_vec())
        .collect();
    assert_eq!(relayed, b"chunk-1;chunk-2;");
    assert!(matches!(last, Err(StreamError::Upstream(_))));
    assert!(last.as_ref().unwrap_err().to_string().starts_with("Stream error:"));

    // No second server is tried once bytes have been relayed.
    assert_eq!(spare.completion_hits(), 0);

    let marked = wait_until(Duration::from_secs(2), || {
        let registry = registry.clone();
        async move {
            registry
                .get_server(server.id)
                .await
                .ok()
                .flatten()
                .is_some_and(|r| {
                    r.health_status == HealthStatus::Unhealthy && r.consecutive_failures == 1
                })
        }
    })
    .await;
    assert!(marked);
}

#[tokio::test]
async fn test_failed_stream_start_marks_server_unhealthy() {
    let backend = MockBackend::start(MockBackendConfig {
        completion_status: StatusCode::INTERNAL_SERVER_ERROR,
        ..Default::default()
    })
    .await;
    let spare = MockBackend::healthy().await;

    let registry = new_registry();
    let server = add_healthy_server(&registry, TEST_MODEL, backend.url()).await;
    add_healthy_server(&registry, TEST_MODEL, spare.url()).await;

    let router = round_robin_router(registry.clone(), Duration::from_secs(5));
    let err = router
        .route_streaming_request(TEST_MODEL, CHAT, &stream_body())
        .await
        .unwrap_err();

    match &err {
        RouteError::Upstream {
            status,
            message,
            registration_id,
        } => {
            assert_eq!(*status, 500);
            assert_eq!(message, "Backend returned status 500");
            assert_eq!(registration_id, &server.registration_id);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.status(), 500);
    assert_eq!(spare.completion_hits(), 0);

    let record = registry.get_server(server.id).await.unwrap().unwrap();
    assert_eq!(record.health_status, HealthStatus::Unhealthy);
    assert_eq!(record.consecutive_failures, 1);
}

#[tokio::test]
async fn test_client_disconnect_closes_upstream_without_feedback() {
    let backend = MockBackend::start(MockBackendConfig {
        stream_forever: true,
        ..Default::default()
    })
    .await;
    let registry = new_registry();
    let server = add_healthy_server(&registry, TEST_MODEL, backend.url()).await;

    let router = round_robin_router(registry.clone(), Duration::from_secs(5));
    let mut route = router
        .route_streaming_request(TEST_MODEL, CHAT, &stream_body())
        .await
        .unwrap();

    let first = route.stream.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"data: "));
    drop(route);

    let backend = &backend;
    let closed =
        wait_until(Duration::from_secs(5), || async move { backend.stream_dropped() }).await;
    assert!(closed);

    let record = registry.get_server(server.id).await.unwrap().unwrap();
    assert_eq!(record.health_status, HealthStatus::Healthy);
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(record.last_successful_request_at, server.last_successful_request_at);
}
