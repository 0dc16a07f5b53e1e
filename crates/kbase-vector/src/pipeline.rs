//! The vector pipeline service: chunk → embed → dual write, plus cached
//! similarity search and document-level chunk management.
//!
//! The relational row is authoritative for existence and listing; the
//! vector index is a secondary copy. The two writes are deliberately not
//! one transaction: a crash between them leaves a chunk readable by id
//! but invisible to search.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use kbase_core::error::{KbError, Result};
use kbase_core::traits::{ChunkRetriever, Embedder, ResultCache, VectorStore};
use kbase_core::types::{ScoredChunk, TextChunk, embedding_to_bytes};

use crate::chunker;
use crate::repo::ChunkRepository;

/// TTL for cached similarity-search results.
pub const SEARCH_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default hit count for searches without an explicit limit.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

pub struct VectorPipeline {
    repo: Arc<ChunkRepository>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    cache: Option<Arc<dyn ResultCache>>,
}

impl VectorPipeline {
    pub fn new(
        repo: Arc<ChunkRepository>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        cache: Option<Arc<dyn ResultCache>>,
    ) -> Self {
        Self { repo, embedder, store, cache }
    }

    /// Split document content into chunk rows. See [`chunker::chunk_text`].
    pub fn chunk_text(
        &self,
        document_id: &str,
        content: &str,
        chunk_size: i64,
    ) -> Result<Vec<TextChunk>> {
        chunker::chunk_text(document_id, content, chunk_size)
    }

    /// Embed a chunk batch and persist it: one batched embed call, chunk
    /// rows into the relational store one at a time, then one columnar
    /// insert into the vector index.
    pub async fn generate_embeddings(&self, chunks: &mut [TextChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self
            .embedder
            .embed(&contents)
            .await
            .map_err(|e| KbError::Upstream(format!("failed to generate embeddings: {e}")))?;

        for (chunk, embedding) in chunks.iter_mut().zip(&embeddings) {
            chunk.embedding = Some(embedding_to_bytes(embedding));
            self.repo.insert(chunk)?;
        }
        tracing::debug!(count = chunks.len(), "chunk rows persisted");

        self.store.insert_chunks(chunks, &embeddings).await
    }

    /// The ingestion unit of work: chunk, embed and store one document's
    /// content. Returns the persisted chunks.
    pub async fn process_document(
        &self,
        document_id: &str,
        content: &str,
        chunk_size: i64,
    ) -> Result<Vec<TextChunk>> {
        let mut chunks = self.chunk_text(document_id, content, chunk_size)?;
        self.generate_embeddings(&mut chunks).await?;
        Ok(chunks)
    }

    /// Cache-first similarity search resolving full chunk rows.
    pub async fn search_similar_chunks(&self, query: &str, limit: usize) -> Result<Vec<TextChunk>> {
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        let key = cache_key("srch", query, limit);

        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(cached)) => {
                    if let Ok(chunks) = serde_json::from_str::<Vec<TextChunk>>(&cached) {
                        return Ok(chunks);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("search cache read failed: {e}"),
            }
        }

        let hits = self.store.retrieve(query, limit, 0.0).await?;
        let ids: Vec<Uuid> = hits
            .iter()
            .filter_map(|h| Uuid::parse_str(&h.id).ok())
            .collect();
        let mut chunks = self.repo.get_by_ids(&ids)?;
        chunks.truncate(limit);

        if let Some(cache) = &self.cache {
            if let Ok(serialized) = serde_json::to_string(&chunks) {
                if let Err(e) = cache.put(&key, &serialized, SEARCH_CACHE_TTL).await {
                    tracing::warn!("search cache write failed: {e}");
                }
            }
        }
        Ok(chunks)
    }

    /// Similarity search keeping the backend's order and per-hit score,
    /// the cross-service search payload.
    pub async fn search_with_scores(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        let hits = self.store.retrieve(query, limit, 0.0).await?;

        let ids: Vec<Uuid> = hits
            .iter()
            .filter_map(|h| Uuid::parse_str(&h.id).ok())
            .collect();
        let rows = self.repo.get_by_ids(&ids)?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                rows.iter()
                    .find(|c| c.id.to_string() == hit.id)
                    .map(|chunk| ScoredChunk { chunk: chunk.clone(), score: hit.score })
            })
            .collect())
    }

    pub fn get_document_chunks(&self, document_id: &str) -> Result<Vec<TextChunk>> {
        let document_id = parse_document_id(document_id)?;
        self.repo.list_by_document(document_id)
    }

    /// Fan-out delete: vector-index rows first (best-effort), then the
    /// authoritative relational rows. Only the relational failure reaches
    /// the caller.
    pub async fn delete_document_chunks(&self, document_id: &str) -> Result<usize> {
        let document_id = parse_document_id(document_id)?;

        let ids: Vec<String> = self
            .repo
            .ids_by_document(document_id)?
            .iter()
            .map(|id| id.to_string())
            .collect();
        if !ids.is_empty() {
            if let Err(e) = self.store.delete_by_ids(&ids).await {
                tracing::warn!(%document_id, "vector index delete failed: {e}");
            }
        }

        let removed = self.repo.delete_by_document(document_id)?;
        tracing::info!(%document_id, removed, "document chunks deleted");
        Ok(removed)
    }
}

#[async_trait]
impl ChunkRetriever for VectorPipeline {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<TextChunk>> {
        self.search_similar_chunks(query, limit).await
    }
}

fn parse_document_id(document_id: &str) -> Result<Uuid> {
    Uuid::parse_str(document_id)
        .map_err(|e| KbError::Validation(format!("invalid document id: {e}")))
}

/// Cache key: prefix + short hash of the query text + limit.
fn cache_key(prefix: &str, text: &str, limit: usize) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut short = String::with_capacity(16);
    for b in &digest[..8] {
        short.push_str(&format!("{b:02x}"));
    }
    format!("{prefix}:{short}:{limit}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbase_core::traits::Embedder;
    use kbase_memory::MemoryCache;
    use rusqlite::Connection;

    use crate::sqlite_store::{SqliteVectorStore, VectorMetric};

    struct CountingEmbedder {
        dimension: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f64>>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(inputs
                .iter()
                .map(|s| {
                    let mut v = vec![0.0f64; self.dimension];
                    for (i, b) in s.bytes().enumerate() {
                        v[i % self.dimension] += b as f64 / 255.0;
                    }
                    v
                })
                .collect())
        }
    }

    fn pipeline(cache: Option<Arc<dyn ResultCache>>) -> (VectorPipeline, Arc<CountingEmbedder>) {
        let embedder = Arc::new(CountingEmbedder {
            dimension: 8,
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let store = SqliteVectorStore::open(
            Connection::open_in_memory().unwrap(),
            embedder.clone(),
            "chunk_vectors",
            8,
            VectorMetric::Cosine,
        )
        .unwrap();
        let repo = ChunkRepository::open(Connection::open_in_memory().unwrap()).unwrap();
        (
            VectorPipeline::new(
                Arc::new(repo),
                embedder.clone(),
                Arc::new(store),
                cache,
            ),
            embedder,
        )
    }

    const DOC: &str = "11111111-2222-3333-4444-555555555555";

    #[tokio::test]
    async fn process_document_persists_rows_and_index() {
        let (pipeline, _) = pipeline(None);
        let chunks = pipeline
            .process_document(DOC, "第一句话。第二句话。", 100)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].embedding.is_some());

        let listed = pipeline.get_document_chunks(DOC).unwrap();
        assert_eq!(listed.len(), 1);

        let found = pipeline.search_similar_chunks("第一句话", 5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, chunks[0].id);
    }

    #[tokio::test]
    async fn reingestion_duplicates_rows_with_fresh_ids() {
        let (pipeline, _) = pipeline(None);
        let first = pipeline.process_document(DOC, "重复内容。", 100).await.unwrap();
        let second = pipeline.process_document(DOC, "重复内容。", 100).await.unwrap();

        assert_ne!(first[0].id, second[0].id);
        assert_eq!(first[0].embedding, second[0].embedding);

        // Both runs are visible relationally and in the index.
        assert_eq!(pipeline.get_document_chunks(DOC).unwrap().len(), 2);
        assert_eq!(
            pipeline.search_similar_chunks("重复内容", 10).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn search_is_served_from_cache_within_ttl() {
        let (pipeline, embedder) = pipeline(Some(Arc::new(MemoryCache::new())));
        pipeline.process_document(DOC, "cached sentence!", 100).await.unwrap();

        let first = pipeline.search_similar_chunks("cached sentence", 5).await.unwrap();
        let calls_after_first = embedder.calls.load(std::sync::atomic::Ordering::SeqCst);

        let second = pipeline.search_similar_chunks("cached sentence", 5).await.unwrap();
        let calls_after_second = embedder.calls.load(std::sync::atomic::Ordering::SeqCst);

        assert_eq!(
            first.iter().map(|c| c.id).collect::<Vec<_>>(),
            second.iter().map(|c| c.id).collect::<Vec<_>>()
        );
        // The second call never reached the embedder/store.
        assert_eq!(calls_after_first, calls_after_second);

        // A different limit is a different cache entry.
        pipeline.search_similar_chunks("cached sentence", 3).await.unwrap();
        assert!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst) > calls_after_second);
    }

    #[tokio::test]
    async fn scored_search_preserves_backend_order() {
        let (pipeline, _) = pipeline(None);
        pipeline
            .process_document(DOC, "alpha topic!\nsomething else entirely!", 20)
            .await
            .unwrap();

        let scored = pipeline.search_with_scores("alpha topic", 2).await.unwrap();
        assert_eq!(scored.len(), 2);
        assert!(scored[0].score >= scored[1].score);
        assert_eq!(scored[0].chunk.content, "alpha topic");
    }

    #[tokio::test]
    async fn delete_removes_rows_and_index_entries() {
        let (pipeline, _) = pipeline(None);
        pipeline.process_document(DOC, "to be removed!", 100).await.unwrap();

        let removed = pipeline.delete_document_chunks(DOC).await.unwrap();
        assert_eq!(removed, 1);
        assert!(pipeline.get_document_chunks(DOC).unwrap().is_empty());
        assert!(
            pipeline
                .search_similar_chunks("to be removed", 5)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn invalid_document_ids_fail_validation() {
        let (pipeline, embedder) = pipeline(None);
        assert!(matches!(
            pipeline.process_document("nope", "text!", 100).await,
            Err(KbError::Validation(_))
        ));
        // Rejected before any embedding work.
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(pipeline.get_document_chunks("nope").is_err());
        assert!(pipeline.delete_document_chunks("nope").await.is_err());
    }

    #[test]
    fn cache_keys_separate_query_and_limit() {
        let a = cache_key("srch", "question", 5);
        let b = cache_key("srch", "question", 10);
        let c = cache_key("srch", "other question", 5);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("srch:"));
    }
}
