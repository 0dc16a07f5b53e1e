//! SQLite-backed vector index adapter.
//!
//! One table per index: `id TEXT PRIMARY KEY, content TEXT, embedding BLOB,
//! metadata TEXT`. Vectors are stored in the backend's native precision
//! (little-endian f32, or packed bits for the binary metric); the metadata
//! blob carries document id, chunk index, position and word count.
//! Retrieval embeds the query, scans the table and scores rows with the
//! configured metric. That is adequate for embedded deployments, and the trait
//! keeps heavier backends pluggable.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::json;

use kbase_core::error::{KbError, Result};
use kbase_core::traits::{Embedder, VectorStore};
use kbase_core::types::{Hit, TextChunk};

/// Default number of hits when the caller passes no limit.
pub const DEFAULT_RETRIEVE_LIMIT: usize = 10;

/// Similarity metric of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMetric {
    /// Cosine similarity over f32 vectors. Higher is better.
    Cosine,
    /// Hamming over bit-packed vectors; reported as matching-bit fraction
    /// so higher is better for both metrics.
    Binary,
}

impl VectorMetric {
    pub fn parse(s: &str) -> VectorMetric {
        if s.eq_ignore_ascii_case("binary") {
            VectorMetric::Binary
        } else {
            VectorMetric::Cosine
        }
    }
}

pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
    table: String,
    dimension: usize,
    metric: VectorMetric,
}

impl SqliteVectorStore {
    pub fn open(
        conn: Connection,
        embedder: Arc<dyn Embedder>,
        table: &str,
        dimension: usize,
        metric: VectorMetric,
    ) -> Result<Self> {
        if dimension == 0 {
            return Err(KbError::Config("vector dimension must be positive".into()));
        }
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| KbError::Storage(format!("set journal mode: {e}")))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL
            );"
        ))
        .map_err(|e| KbError::Storage(format!("create index table: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            embedder,
            table: table.to_string(),
            dimension,
            metric,
        })
    }

    /// Convert one f64 vector into the index's native byte layout,
    /// validating its dimension.
    fn encode_vector(&self, vector: &[f64]) -> Result<Vec<u8>> {
        if vector.len() != self.dimension {
            return Err(KbError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(match self.metric {
            VectorMetric::Cosine => {
                let mut buf = Vec::with_capacity(vector.len() * 4);
                for v in vector {
                    buf.extend_from_slice(&(*v as f32).to_le_bytes());
                }
                buf
            }
            VectorMetric::Binary => pack_bits(vector),
        })
    }

    fn score(&self, query: &[u8], row: &[u8]) -> f32 {
        match self.metric {
            VectorMetric::Cosine => cosine_similarity(query, row),
            VectorMetric::Binary => matching_bit_fraction(query, row),
        }
    }
}

/// Sign-quantize an f64 vector into a packed bit string (MSB first).
fn pack_bits(vector: &[f64]) -> Vec<u8> {
    let mut buf = vec![0u8; vector.len().div_ceil(8)];
    for (i, v) in vector.iter().enumerate() {
        if *v > 0.0 {
            buf[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    buf
}

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[u8], b: &[u8]) -> f32 {
    let a = decode_f32(a);
    let b = decode_f32(b);
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn matching_bit_fraction(a: &[u8], b: &[u8]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let bits = (a.len() * 8) as f32;
    let differing: u32 = a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum();
    1.0 - differing as f32 / bits
}

fn chunk_metadata(chunk: &TextChunk) -> String {
    json!({
        "document_id": chunk.document_id,
        "chunk_index": chunk.chunk_index,
        "start_pos": chunk.start_pos,
        "end_pos": chunk.end_pos,
        "word_count": chunk.word_count,
    })
    .to_string()
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn insert_chunks(&self, chunks: &[TextChunk], embeddings: &[Vec<f64>]) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(KbError::Validation(format!(
                "chunks and embeddings length mismatch: {} vs {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        if chunks.is_empty() {
            return Ok(());
        }

        // Encode (and dimension-check) every row before touching the table.
        let mut rows = Vec::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            rows.push((
                chunk.id.to_string(),
                chunk.content.clone(),
                self.encode_vector(embedding)?,
                chunk_metadata(chunk),
            ));
        }

        let mut conn = self.conn.lock().map_err(|e| KbError::Storage(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| KbError::Storage(format!("begin insert: {e}")))?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO {} (id, content, embedding, metadata) VALUES (?1, ?2, ?3, ?4)",
                    self.table
                ))
                .map_err(|e| KbError::Storage(e.to_string()))?;
            for (id, content, embedding, metadata) in &rows {
                stmt.execute(rusqlite::params![id, content, embedding, metadata])
                    .map_err(|e| KbError::Storage(format!("insert vector row: {e}")))?;
            }
        }
        tx.commit()
            .map_err(|e| KbError::Storage(format!("commit insert: {e}")))?;

        tracing::debug!(table = %self.table, count = chunks.len(), "vector rows inserted");
        Ok(())
    }

    async fn retrieve(&self, query: &str, limit: usize, score_threshold: f32) -> Result<Vec<Hit>> {
        let limit = if limit == 0 { DEFAULT_RETRIEVE_LIMIT } else { limit };

        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vec = vectors
            .first()
            .ok_or_else(|| KbError::Upstream("embedder returned no query vector".into()))?;
        let query_bytes = self.encode_vector(query_vec)?;

        let mut hits: Vec<Hit> = {
            let conn = self.conn.lock().map_err(|e| KbError::Storage(e.to_string()))?;
            let mut stmt = conn
                .prepare(&format!("SELECT id, embedding FROM {}", self.table))
                .map_err(|e| KbError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(|e| KbError::Storage(e.to_string()))?;

            rows.filter_map(|r| r.ok())
                .map(|(id, embedding)| Hit {
                    score: self.score(&query_bytes, &embedding),
                    id,
                })
                .collect()
        };

        if score_threshold > 0.0 {
            hits.retain(|h| h.score >= score_threshold);
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().map_err(|e| KbError::Storage(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!("DELETE FROM {} WHERE id = ?1", self.table))
            .map_err(|e| KbError::Storage(e.to_string()))?;
        for id in ids {
            stmt.execute(rusqlite::params![id])
                .map_err(|e| KbError::Storage(format!("delete vector row: {e}")))?;
        }
        Ok(())
    }

    async fn index_chunks(&self, chunks: &[TextChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embedder.embed(&contents).await?;
        self.insert_chunks(chunks, &embeddings).await
    }
}
