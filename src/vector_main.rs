//! Vector service entry point.
//!
//! Wires the chunk repository, the SQLite vector index, the embedding
//! client and the optional Redis cache into the pipeline, validates the
//! embedding dimension against the index configuration once, spawns the
//! ingestion consumer and serves the chunk/search HTTP API.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use kbase_core::config::KbaseConfig;
use kbase_core::error::KbError;
use kbase_core::traits::{Embedder, ResultCache};
use kbase_providers::OpenAiEmbeddingClient;
use kbase_server::{VectorState, serve, vector_router};
use kbase_vector::{ChunkRepository, SqliteVectorStore, VectorMetric, VectorPipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = KbaseConfig::load().context("failed to load configuration")?;
    tracing::info!(service = "vector", "starting vector service");

    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbeddingClient::new(&config.embedding)?);

    // Validate the embedder's output dimension against the index field
    // once. A mismatch here is fatal; it must never surface per request.
    let probe = embedder
        .embed(&["dimension probe".to_string()])
        .await
        .context("embedding dimension probe failed")?;
    let actual = probe.first().map(|v| v.len()).unwrap_or(0);
    if actual != config.embedding.dimension {
        return Err(KbError::DimensionMismatch {
            expected: config.embedding.dimension,
            actual,
        }
        .into());
    }
    tracing::info!(dimension = actual, "embedding dimension validated");

    let repo = Arc::new(ChunkRepository::open(
        rusqlite::Connection::open(&db_path).map_err(|e| KbError::Storage(e.to_string()))?,
    )?);
    let store = Arc::new(SqliteVectorStore::open(
        rusqlite::Connection::open(&db_path).map_err(|e| KbError::Storage(e.to_string()))?,
        embedder.clone(),
        &config.vector.table,
        config.embedding.dimension,
        VectorMetric::parse(&config.vector.metric),
    )?);

    let cache: Option<Arc<dyn ResultCache>> = if config.redis.url.is_empty() {
        tracing::info!("redis disabled; similarity search runs uncached");
        None
    } else {
        let conn = kbase_memory::redis::connect(&config.redis.url).await?;
        Some(Arc::new(kbase_memory::RedisCache::new(conn)))
    };

    let pipeline = Arc::new(VectorPipeline::new(repo, embedder, store, cache));

    // Ingestion consumer: one background task, sequential, bounded by the
    // channel prefetch. A broker outage only disables async ingestion;
    // the HTTP API keeps serving.
    let consumer_pipeline = pipeline.clone();
    let queue_config = config.queue.clone();
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let consumer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match kbase_ingest::QueueClient::connect(&queue_config.url, &queue_config.name).await {
            Ok(client) => {
                if let Err(e) = kbase_ingest::run_consumer(
                    client,
                    consumer_pipeline,
                    queue_config.prefetch,
                    consumer_shutdown,
                )
                .await
                {
                    tracing::error!("ingestion consumer stopped: {e}");
                }
            }
            Err(e) => tracing::error!("failed to connect to broker: {e}"),
        }
    });

    let state = VectorState { pipeline, started_at: Instant::now() };
    let result = serve(
        vector_router(state),
        &config.server.host,
        config.server.vector_port,
    )
    .await;
    shutdown.notify_one();
    result
}
