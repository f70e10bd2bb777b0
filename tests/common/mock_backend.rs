use std::{
    convert::Infallible,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::stream::{self, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{RwLock, oneshot};

/// Configuration for mock backend behavior
#[derive(Clone, Debug)]
pub struct MockBackendConfig {
    pub models_status: StatusCode,
    pub models_body: Value,
    pub models_delay_ms: u64,
    pub completion_status: StatusCode,
    pub completion_body: Value,
    /// Served as text/plain instead of `completion_body` when set
    pub completion_raw: Option<String>,
    pub completion_delay_ms: u64,
    pub stream_chunks: Vec<String>,
    pub stream_content_type: String,
    pub stream_chunk_delay_ms: u64,
    /// Abort the connection after the last chunk instead of finishing cleanly
    pub stream_fail_after_chunks: bool,
    /// Emit chunks until the client goes away
    pub stream_forever: bool,
    pub required_api_key: Option<String>,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            models_status: StatusCode::OK,
            models_body: json!({"object": "list", "data": [{"id": "mock-model", "object": "model"}]}),
            models_delay_ms: 0,
            completion_status: StatusCode::OK,
            completion_body: json!({
                "id": "cmpl-mock",
                "object": "chat.completion",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}]
            }),
            completion_raw: None,
            completion_delay_ms: 0,
            stream_chunks: vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_string(),
                "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n".to_string(),
                "data: [DONE]\n\n".to_string(),
            ],
            stream_content_type: "text/event-stream".to_string(),
            stream_chunk_delay_ms: 20,
            stream_fail_after_chunks: false,
            stream_forever: false,
            required_api_key: None,
        }
    }
}

struct MockState {
    config: RwLock<MockBackendConfig>,
    models_hits: AtomicUsize,
    completion_hits: AtomicUsize,
    stream_dropped: Arc<AtomicBool>,
}

/// Sets the flag when the response body is dropped, i.e. the client went away.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Mock OpenAI-compatible backend on an ephemeral loopback port
pub struct MockBackend {
    state: Arc<MockState>,
    url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockBackend {
    pub async fn start(config: MockBackendConfig) -> Self {
        let state = Arc::new(MockState {
            config: RwLock::new(config),
            models_hits: AtomicUsize::new(0),
            completion_hits: AtomicUsize::new(0),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        });

        let app = Router::new()
            .route("/v1/models", get(models_handler))
            .route("/v1/chat/completions", post(completion_handler))
            .route("/v1/completions", post(completion_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock backend addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                eprintln!("Mock backend error: {}", e);
            }
        });

        Self {
            state,
            url: format!("http://{addr}"),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub async fn healthy() -> Self {
        Self::start(MockBackendConfig::default()).await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn models_hits(&self) -> usize {
        self.state.models_hits.load(Ordering::SeqCst)
    }

    pub fn completion_hits(&self) -> usize {
        self.state.completion_hits.load(Ordering::SeqCst)
    }

    pub fn stream_dropped(&self) -> bool {
        self.state.stream_dropped.load(Ordering::SeqCst)
    }

    pub async fn set_models_status(&self, status: StatusCode) {
        self.state.config.write().await.models_status = status;
    }

    pub async fn set_completion_status(&self, status: StatusCode) {
        self.state.config.write().await.completion_status = status;
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn authorized(config: &MockBackendConfig, headers: &HeaderMap) -> bool {
    match &config.required_api_key {
        None => true,
        Some(key) => {
            let expected = format!("Bearer {key}");
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                == Some(expected.as_str())
        }
    }
}

async fn models_handler(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.models_hits.fetch_add(1, Ordering::SeqCst);
    let config = state.config.read().await.clone();
    if !authorized(&config, &headers) {
        return (StatusCode::UNAUTHORIZED, "missing key").into_response();
    }
    if config.models_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.models_delay_ms)).await;
    }
    (config.models_status, Json(config.models_body)).into_response()
}

async fn completion_handler(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.completion_hits.fetch_add(1, Ordering::SeqCst);
    let config = state.config.read().await.clone();

    if !authorized(&config, &headers) {
        return (StatusCode::UNAUTHORIZED, "missing key").into_response();
    }
    if config.completion_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.completion_delay_ms)).await;
    }
    if config.completion_status != StatusCode::OK {
        return (
            config.completion_status,
            Json(json!({"error": {"message": "mock failure"}})),
        )
            .into_response();
    }

    if body.get("stream").and_then(Value::as_bool) == Some(true) {
        return stream_response(&state, &config);
    }

    match config.completion_raw {
        Some(raw) => raw.into_response(),
        None => Json(config.completion_body).into_response(),
    }
}

fn stream_response(state: &MockState, config: &MockBackendConfig) -> Response {
    let delay = Duration::from_millis(config.stream_chunk_delay_ms);

    let body = if config.stream_forever {
        let guard = DropFlag(state.stream_dropped.clone());
        let chunks = stream::unfold((guard, 0usize), move |(guard, n)| async move {
            tokio::time::sleep(delay).await;
            let chunk = Bytes::from(format!("data: {{\"n\":{n}}}\n\n"));
            Some((Ok::<_, Infallible>(chunk), (guard, n + 1)))
        });
        Body::from_stream(chunks)
    } else {
        let fail = config.stream_fail_after_chunks;
        let chunks = stream::iter(config.stream_chunks.clone())
            .then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, io::Error>(Bytes::from(chunk))
            })
            .chain(stream::iter(fail.then(|| {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "backend crashed"))
            })));
        Body::from_stream(chunks)
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, config.stream_content_type.as_str())
        .body(body)
        .expect("stream response")
}
