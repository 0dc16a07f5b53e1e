//! Query service handlers: synchronous answers and the SSE stream.
//!
//! The stream endpoint multiplexes three sources onto one connection:
//! answer fragments as `data:` frames, a fixed 5-second heartbeat as
//! `event: ping`, and a terminal `event: error` frame. Client disconnect
//! drops the response stream, which stops the relay loop; no further
//! frames are produced. Closing the channel is the only end-of-stream
//! signal.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use kbase_core::error::KbError;
use kbase_core::types::RagQueryRequest;

use crate::identity::CallerIdentity;
use crate::server::QueryState;

/// Interval between `event: ping` frames on an open stream.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct RagRequest {
    pub query: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: i64,
    #[serde(default)]
    pub session_id: String,
}

impl RagRequest {
    /// Apply the service defaults for absent or non-positive fields.
    fn into_query(self) -> RagQueryRequest {
        RagQueryRequest {
            query: self.query,
            limit: if self.limit <= 0 { 5 } else { self.limit as usize },
            temperature: if self.temperature <= 0.0 { 0.7 } else { self.temperature },
            max_tokens: if self.max_tokens <= 0 { 1024 } else { self.max_tokens as u32 },
            session_id: self.session_id,
        }
    }
}

/// Synchronous RAG query.
pub async fn ask(
    State(state): State<Arc<QueryState>>,
    identity: CallerIdentity,
    Json(req): Json<RagRequest>,
) -> Response {
    let req = req.into_query();
    let start = Instant::now();

    match state.service.ask_sync(identity.0, &req).await {
        Ok(result) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "answer": result.answer,
                "sources": result.sources,
                "usage": result.usage,
                "latency_ms": start.elapsed().as_millis() as u64,
            })),
        )
            .into_response(),
        Err(KbError::Validation(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": msg})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("rag ask failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "rag ask failed"})),
            )
                .into_response()
        }
    }
}

/// Streaming RAG query over SSE.
pub async fn ask_stream(
    State(state): State<Arc<QueryState>>,
    identity: CallerIdentity,
    Json(req): Json<RagRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let req = req.into_query();
    let (fragments, errors) = state.service.ask_stream(identity.0, req);

    Sse::new(relay_stream(fragments, errors))
}

/// Multiplex fragments, heartbeats and a terminal error onto one event
/// stream. Once the returned stream is dropped (client gone), the relay
/// task stops on its next send.
fn relay_stream(
    mut fragments: mpsc::Receiver<String>,
    mut errors: mpsc::Receiver<KbError>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, rx) = mpsc::channel::<Event>(16);

    tokio::spawn(async move {
        // First heartbeat after one full interval, not immediately.
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        let mut errors_done = false;

        loop {
            tokio::select! {
                fragment = fragments.recv() => match fragment {
                    Some(text) => {
                        if tx.send(Event::default().data(text)).await.is_err() {
                            return;
                        }
                    }
                    // Channel closed: the answer is complete.
                    None => return,
                },
                error = errors.recv(), if !errors_done => match error {
                    Some(e) => {
                        tracing::error!("rag stream error: {e}");
                        let _ = tx.send(Event::default().event("error").data(e.to_string())).await;
                        return;
                    }
                    None => errors_done = true,
                },
                _ = heartbeat.tick() => {
                    if tx.send(Event::default().event("ping").data("heartbeat")).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    ReceiverStream::new(rx).map(Ok)
}
