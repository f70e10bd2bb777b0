#![allow(dead_code)]

pub mod mock_backend;

use std::{sync::Arc, time::Duration};

use inference_gateway::{
    data_connector::{MemoryRegistryStorage, NewServer, RegistryStorage, ServerRecord},
    policies::RoundRobinPolicy,
    routers::RequestRouter,
};

pub const TEST_MODEL: &str = "llama-3-8b";

pub fn new_registry() -> Arc<MemoryRegistryStorage> {
    Arc::new(MemoryRegistryStorage::new())
}

pub fn new_server(model: &str, endpoint_url: &str) -> NewServer {
    NewServer {
        model_name: model.to_string(),
        endpoint_url: endpoint_url.to_string(),
        ..Default::default()
    }
}

/// Creates a record and marks it healthy, skipping the registration probe.
pub async fn add_healthy_server(
    registry: &Arc<MemoryRegistryStorage>,
    model: &str,
    endpoint_url: &str,
) -> ServerRecord {
    let record = registry
        .create_server(new_server(model, endpoint_url))
        .await
        .expect("create server");
    registry
        .record_health_result(record.id, true, None)
        .await
        .expect("mark healthy")
}

/// An endpoint nothing listens on: binds an ephemeral port, then releases it.
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe port");
    let addr = listener.local_addr().expect("probe addr");
    drop(listener);
    format!("http://{addr}")
}

pub fn round_robin_router(
    registry: Arc<MemoryRegistryStorage>,
    request_timeout: Duration,
) -> RequestRouter {
    RequestRouter::new(
        reqwest::Client::new(),
        registry,
        Arc::new(RoundRobinPolicy::new()),
        request_timeout,
    )
}

/// Polls `check` every 20ms until it holds or `deadline` passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
