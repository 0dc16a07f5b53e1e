//! Query service entry point.
//!
//! Wires the chat client, the cross-service search client, conversation
//! memory and the answer cache into the RAG query service and serves the
//! sync + streaming query API.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use kbase_core::config::KbaseConfig;
use kbase_core::traits::{ChatModel, ChunkRetriever, ConversationStore, ResultCache};
use kbase_providers::OpenAiChatClient;
use kbase_query::{RagQueryService, RemoteSearchClient};
use kbase_server::{QueryState, query_router, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = KbaseConfig::load().context("failed to load configuration")?;
    tracing::info!(service = "query", "starting query service");

    let chat: Arc<dyn ChatModel> = Arc::new(OpenAiChatClient::new(&config.llm));

    // Identity under which this service queries the vector service; the
    // per-caller identity stays at the delivery layer.
    let service_user = uuid::Uuid::new_v4();
    let retriever: Arc<dyn ChunkRetriever> = Arc::new(RemoteSearchClient::new(
        &config.query.vector_service_url,
        service_user,
    ));
    tracing::info!(
        vector_service = %config.query.vector_service_url,
        "using cross-service search"
    );

    let (memory, cache): (Option<Arc<dyn ConversationStore>>, Option<Arc<dyn ResultCache>>) =
        if config.redis.url.is_empty() {
            tracing::info!("redis disabled; no conversation memory or answer cache");
            (None, None)
        } else {
            let conn = kbase_memory::redis::connect(&config.redis.url).await?;
            (
                Some(Arc::new(kbase_memory::RedisConversationStore::new(conn.clone()))),
                Some(Arc::new(kbase_memory::RedisCache::new(conn))),
            )
        };

    let service = Arc::new(RagQueryService::new(retriever, chat, memory, cache));
    let state = QueryState { service, started_at: Instant::now() };

    serve(
        query_router(state),
        &config.server.host,
        config.server.query_port,
    )
    .await
}
