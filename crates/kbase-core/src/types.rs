//! Domain types shared across the kbase services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KbError, Result};

/// A contiguous text segment derived from a document, the unit of
/// embedding and retrieval. Rows live in the relational store (source of
/// truth); the vector index holds a secondary copy for similarity search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub chunk_index: i64,
    pub start_pos: i64,
    pub end_pos: i64,
    /// Code-point count of `content`: character based, not whitespace
    /// tokenized, so CJK and Latin text are counted uniformly.
    pub word_count: i64,
    /// Little-endian f64 byte image of the embedding, populated by the
    /// pipeline before the row is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// One similarity-search match: chunk id plus the backend's native score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    pub score: f32,
}

/// A chunk joined with its retrieval score, as returned by the
/// cross-service search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: TextChunk,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse a stored role tag. Unknown tags fall back to `User`, so a
    /// corrupted history entry degrades instead of failing the query.
    pub fn parse(s: &str) -> Role {
        match s {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

/// One entry in a per-session conversation log. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// Sampling/limit parameters forwarded to the chat model.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self { temperature: 0.7, max_tokens: 1024 }
    }
}

/// Token accounting reported by the chat model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A complete (non-streaming) chat model response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: Usage,
}

/// One RAG query, sync or streaming. Transient; one per call.
#[derive(Debug, Clone)]
pub struct RagQueryRequest {
    pub query: String,
    pub limit: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub session_id: String,
}

/// Reference to a retrieved chunk included in a query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i64,
    pub content_excerpt: String,
}

/// The answer to a RAG query, with provenance and token usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagQueryResult {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub usage: Usage,
}

/// Serialize an embedding as little-endian f64 bytes for the relational row.
pub fn embedding_to_bytes(vector: &[f64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * 8);
    for v in vector {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Inverse of [`embedding_to_bytes`].
pub fn embedding_from_bytes(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(KbError::Storage(format!(
            "invalid embedding byte length: {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// Truncate a string to at most `n` code points, never splitting inside a
/// multi-byte character.
pub fn truncate_chars(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        return s.to_string();
    }
    s.chars().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_bytes_round_trip() {
        let v = vec![0.0, -1.5, 3.25, f64::MAX];
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes.len(), 32);
        assert_eq!(embedding_from_bytes(&bytes).unwrap(), v);
    }

    #[test]
    fn embedding_bytes_rejects_odd_length() {
        assert!(embedding_from_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn truncate_is_code_point_aligned() {
        assert_eq!(truncate_chars("中文句子测试", 3), "中文句");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn role_parse_falls_back_to_user() {
        assert_eq!(Role::parse("assistant"), Role::Assistant);
        assert_eq!(Role::parse("system"), Role::System);
        assert_eq!(Role::parse("garbage"), Role::User);
    }
}
