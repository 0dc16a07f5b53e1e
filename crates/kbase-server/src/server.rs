//! Router assembly and serving for the two services.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use kbase_query::RagQueryService;
use kbase_vector::VectorPipeline;

/// Shared state of the vector service.
#[derive(Clone)]
pub struct VectorState {
    pub pipeline: Arc<VectorPipeline>,
    pub started_at: Instant,
}

/// Shared state of the query service.
#[derive(Clone)]
pub struct QueryState {
    pub service: Arc<RagQueryService>,
    pub started_at: Instant,
}

async fn vector_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "vector",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn query_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "query",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn common_layers(router: Router) -> Router {
    router
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Build the vector service router.
pub fn vector_router(state: VectorState) -> Router {
    let router = Router::new()
        .route("/api/v1/vectors/chunk", post(super::vector_routes::chunk_document))
        .route("/api/v1/vectors/search", post(super::vector_routes::search_similar))
        .route(
            "/api/v1/vectors/search/scored",
            post(super::vector_routes::search_scored),
        )
        .route(
            "/api/v1/vectors/documents/{document_id}/chunks",
            get(super::vector_routes::get_document_chunks)
                .delete(super::vector_routes::delete_document_chunks),
        )
        .route("/health", get(vector_health))
        .with_state(Arc::new(state));
    common_layers(router)
}

/// Build the query service router.
pub fn query_router(state: QueryState) -> Router {
    let router = Router::new()
        .route("/api/v1/rag/query", post(super::query_routes::ask))
        .route("/api/v1/rag/query/stream", post(super::query_routes::ask_stream))
        .route("/health", get(query_health))
        .with_state(Arc::new(state));
    common_layers(router)
}

/// Bind and serve a router until ctrl-c.
pub async fn serve(router: Router, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
