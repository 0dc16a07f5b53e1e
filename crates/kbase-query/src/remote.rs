//! Cross-service search client.
//!
//! When the query and vector services run as separate processes, retrieval
//! goes over HTTP to the vector service's scored-search endpoint. The
//! client implements the same [`ChunkRetriever`] seam as the local
//! pipeline, so the choice of transport is invisible to the RAG service.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use kbase_core::error::{KbError, Result};
use kbase_core::traits::ChunkRetriever;
use kbase_core::types::{ScoredChunk, TextChunk};

pub struct RemoteSearchClient {
    base_url: String,
    client: reqwest::Client,
    /// Caller identity forwarded as `x-user-id`; the vector service sits
    /// behind the same gateway-verified identity scheme.
    service_user: Uuid,
}

impl RemoteSearchClient {
    pub fn new(base_url: &str, service_user: Uuid) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            service_user,
        }
    }

    /// Scored search against the remote vector service, preserving the
    /// backend's ordering.
    pub async fn search_scored(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let url = format!("{}/api/v1/vectors/search/scored", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-user-id", self.service_user.to_string())
            .json(&json!({ "query": query, "limit": limit }))
            .send()
            .await
            .map_err(|e| KbError::Upstream(format!("vector service unreachable ({url}): {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(KbError::Upstream(format!("vector service error {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| KbError::Upstream(format!("vector service response parse: {e}")))?;
        let chunks = body
            .get("chunks")
            .cloned()
            .ok_or_else(|| KbError::Upstream("no chunks in vector service response".into()))?;
        serde_json::from_value(chunks)
            .map_err(|e| KbError::Upstream(format!("vector service chunk parse: {e}")))
    }
}

#[async_trait]
impl ChunkRetriever for RemoteSearchClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<TextChunk>> {
        let scored = self.search_scored(query, limit).await?;
        Ok(scored.into_iter().map(|s| s.chunk).collect())
    }
}
