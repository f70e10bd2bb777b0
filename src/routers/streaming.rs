//! Relays a backend's streamed body to the client, chunk by chunk.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    data_connector::{RegistryStorage, ServerRecord},
    observability::metrics::GatewayMetrics,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Stream error: {0}")]
    Upstream(String),

    #[error("Stream idle for more than {0} seconds")]
    IdleTimeout(u64),
}

/// Chunks the relay may hold ahead of a slow client before it stops reading
/// from the backend.
const RELAY_BUFFER: usize = 32;

/// Finite, single-pass stream of backend bytes. Ends with at most one error.
pub type GatewayStream = ReceiverStream<Result<Bytes, StreamError>>;

/// A started stream plus the server it is attached to.
pub struct StreamingRoute {
    pub server: ServerRecord,
    pub status: u16,
    pub content_type: Option<String>,
    pub stream: GatewayStream,
}

impl std::fmt::Debug for StreamingRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRoute")
            .field("registration_id", &self.server.registration_id)
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

enum RelayEnd {
    Completed,
    Failed(String),
    ClientGone,
}

/// Spawns the relay task and returns the receiving side.
///
/// Health feedback is written once the upstream finishes: success on a clean
/// end, a failure on an upstream error or idle timeout. A dropped receiver
/// stops the relay and drops the upstream response without feedback.
pub(super) fn spawn_relay(
    response: reqwest::Response,
    server: &ServerRecord,
    registry: Arc<dyn RegistryStorage>,
    idle_timeout: Duration,
) -> GatewayStream {
    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    let server_id = server.id;
    let registration_id = server.registration_id.clone();
    let model = server.model_name.clone();

    tokio::spawn(async move {
        let mut upstream = response.bytes_stream();

        let end = loop {
            let next = tokio::select! {
                _ = tx.closed() => break RelayEnd::ClientGone,
                next = tokio::time::timeout(idle_timeout, upstream.next()) => next,
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break RelayEnd::ClientGone;
                    }
                }
                Ok(Some(Err(e))) => {
                    let error = StreamError::Upstream(e.to_string());
                    let message = error.to_string();
                    let _ = tx.send(Err(error)).await;
                    break RelayEnd::Failed(message);
                }
                Ok(None) => break RelayEnd::Completed,
                Err(_) => {
                    let error = StreamError::IdleTimeout(idle_timeout.as_secs());
                    let message = error.to_string();
                    let _ = tx.send(Err(error)).await;
                    break RelayEnd::Failed(message);
                }
            }
        };
        drop(upstream);

        match end {
            RelayEnd::Completed => {
                debug!(registration_id = %registration_id, "Stream completed");
                GatewayMetrics::record_stream_outcome(&model, "completed");
                if let Err(e) = registry.record_request_success(server_id).await {
                    warn!(registration_id = %registration_id, error = %e, "Failed to record stream success");
                }
            }
            RelayEnd::Failed(message) => {
                warn!(registration_id = %registration_id, error = %message, "Stream terminated by upstream failure");
                GatewayMetrics::record_stream_outcome(&model, "upstream_error");
                if let Err(e) = registry
                    .record_health_result(server_id, false, Some(&message))
                    .await
                {
                    warn!(registration_id = %registration_id, error = %e, "Failed to record stream failure");
                }
            }
            RelayEnd::ClientGone => {
                debug!(registration_id = %registration_id, "Client disconnected, closing upstream stream");
                GatewayMetrics::record_stream_outcome(&model, "client_disconnected");
            }
        }
    });

    ReceiverStream::new(rx)
}
