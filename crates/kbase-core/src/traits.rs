//! Trait seams between the kbase services and their backends.
//!
//! Every external collaborator (embedding API, chat model, vector index,
//! cache, conversation memory) sits behind one of these traits so services
//! are wired with `Arc<dyn …>` handles constructed once at startup, and
//! tests substitute in-process stubs.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    ConversationTurn, GenerateParams, Hit, ProviderResponse, TextChunk,
};

/// Maps a batch of strings to fixed-dimension float vectors.
///
/// Implementations must be order-preserving, stateless across calls and
/// safe for concurrent use.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f64>>>;
}

/// A chat model with a one-shot and a streaming generation path.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(
        &self,
        messages: &[ConversationTurn],
        params: &GenerateParams,
    ) -> Result<ProviderResponse>;

    /// Start a streaming generation. Fragments arrive on the returned
    /// channel in order; a transport failure mid-stream is delivered as a
    /// final `Err` item; channel closure signals end-of-stream.
    async fn stream(
        &self,
        messages: &[ConversationTurn],
        params: &GenerateParams,
    ) -> Result<mpsc::Receiver<Result<String>>>;
}

/// A backend index for nearest-neighbor search over embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Columnar batch insert of pre-embedded chunks. Errors if the slices
    /// differ in length. All-or-nothing per call.
    async fn insert_chunks(
        &self,
        chunks: &[TextChunk],
        embeddings: &[Vec<f64>],
    ) -> Result<()>;

    /// Embed `query` and return up to `limit` hits, descending by the
    /// backend's native score. Hits below a positive `score_threshold` are
    /// excluded. `limit == 0` defaults to 10.
    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<Hit>>;

    /// Remove matching rows. Empty input is a no-op; unknown ids are not
    /// an error.
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()>;

    /// Alternate insertion path deriving vectors from chunk content.
    async fn index_chunks(&self, chunks: &[TextChunk]) -> Result<()>;
}

/// Retrieval seam used by the RAG query service: either the local vector
/// pipeline or a remote vector service behind HTTP.
#[async_trait]
pub trait ChunkRetriever: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<TextChunk>>;
}

/// Append-only per-(user, session) conversation log with a TTL.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, user_id: Uuid, session_id: &str, turn: &ConversationTurn) -> Result<()>;

    /// Prior turns in append order.
    async fn history(&self, user_id: Uuid, session_id: &str) -> Result<Vec<ConversationTurn>>;
}

/// String key-value cache with per-entry TTL. Failures are never fatal to
/// the caller.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}
