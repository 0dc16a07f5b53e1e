//! Vector service handlers: chunking, search and document chunk management.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Json, response::IntoResponse};
use serde::Deserialize;

use kbase_core::error::KbError;

use crate::identity::CallerIdentity;
use crate::server::VectorState;

#[derive(Debug, Deserialize)]
pub struct ChunkDocumentRequest {
    pub document_id: String,
    pub content: String,
    #[serde(default)]
    pub chunk_size: i64,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: i64,
}

fn error_response(err: &KbError, action: &str) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        KbError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // Detail stays in the log; clients get a stable generic message.
    (status, Json(serde_json::json!({"error": format!("failed to {action}")})))
}

fn effective_limit(limit: i64) -> usize {
    if limit <= 0 { 0 } else { limit as usize }
}

/// Chunk a document, embed the chunks and store them.
pub async fn chunk_document(
    State(state): State<Arc<VectorState>>,
    _identity: CallerIdentity,
    Json(req): Json<ChunkDocumentRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .process_document(&req.document_id, &req.content, req.chunk_size)
        .await
    {
        Ok(chunks) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "document_id": req.document_id,
                "chunks": chunks,
                "message": "document chunked and embedded successfully",
            })),
        ),
        Err(e) => {
            tracing::error!(document_id = %req.document_id, "failed to chunk document: {e}");
            error_response(&e, "chunk document")
        }
    }
}

/// Search for similar chunks.
pub async fn search_similar(
    State(state): State<Arc<VectorState>>,
    _identity: CallerIdentity,
    Json(req): Json<SearchRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .search_similar_chunks(&req.query, effective_limit(req.limit))
        .await
    {
        Ok(chunks) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "query": req.query,
                "count": chunks.len(),
                "chunks": chunks,
            })),
        ),
        Err(e) => {
            tracing::error!(query = %req.query, "failed to search similar chunks: {e}");
            error_response(&e, "search similar chunks")
        }
    }
}

/// Search returning per-item scores (the cross-service search surface).
pub async fn search_scored(
    State(state): State<Arc<VectorState>>,
    _identity: CallerIdentity,
    Json(req): Json<SearchRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .search_with_scores(&req.query, effective_limit(req.limit))
        .await
    {
        Ok(chunks) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "query": req.query,
                "count": chunks.len(),
                "chunks": chunks,
            })),
        ),
        Err(e) => {
            tracing::error!(query = %req.query, "failed to run scored search: {e}");
            error_response(&e, "search similar chunks")
        }
    }
}

/// List all chunks of a document.
pub async fn get_document_chunks(
    State(state): State<Arc<VectorState>>,
    _identity: CallerIdentity,
    Path(document_id): Path<String>,
) -> impl IntoResponse {
    match state.pipeline.get_document_chunks(&document_id) {
        Ok(chunks) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "document_id": document_id,
                "count": chunks.len(),
                "chunks": chunks,
            })),
        ),
        Err(e) => {
            tracing::error!(%document_id, "failed to get document chunks: {e}");
            error_response(&e, "get document chunks")
        }
    }
}

/// Delete all chunks of a document from both stores.
pub async fn delete_document_chunks(
    State(state): State<Arc<VectorState>>,
    _identity: CallerIdentity,
    Path(document_id): Path<String>,
) -> impl IntoResponse {
    match state.pipeline.delete_document_chunks(&document_id).await {
        Ok(removed) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "document_id": document_id,
                "removed": removed,
                "message": "document chunks deleted successfully",
            })),
        ),
        Err(e) => {
            tracing::error!(%document_id, "failed to delete document chunks: {e}");
            error_response(&e, "delete document chunks")
        }
    }
}
