//! Relational chunk repository, the source of truth for chunk existence
//! and ownership. The vector index is a secondary copy maintained
//! best-effort beside it.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use kbase_core::error::{KbError, Result};
use kbase_core::types::TextChunk;

pub struct ChunkRepository {
    conn: Mutex<Connection>,
}

impl ChunkRepository {
    pub fn open(conn: Connection) -> Result<Self> {
        // WAL so the repository and the vector index can share one file.
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| KbError::Storage(format!("set journal mode: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS text_chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                content TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_pos INTEGER NOT NULL,
                end_pos INTEGER NOT NULL,
                word_count INTEGER NOT NULL,
                embedding BLOB,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_text_chunks_document
                ON text_chunks(document_id);",
        )
        .map_err(|e| KbError::Storage(format!("migrate text_chunks: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn insert(&self, chunk: &TextChunk) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| KbError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO text_chunks
                (id, document_id, content, chunk_index, start_pos, end_pos, word_count, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                chunk.id.to_string(),
                chunk.document_id.to_string(),
                chunk.content,
                chunk.chunk_index,
                chunk.start_pos,
                chunk.end_pos,
                chunk.word_count,
                chunk.embedding,
                chunk.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| KbError::Storage(format!("insert chunk: {e}")))?;
        Ok(())
    }

    /// Fetch full rows for the given ids. Missing ids are simply absent
    /// from the result.
    pub fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<TextChunk>> {
        let mut chunks = Vec::with_capacity(ids.len());
        let conn = self.conn.lock().map_err(|e| KbError::Storage(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, content, chunk_index, start_pos, end_pos,
                        word_count, embedding, created_at
                 FROM text_chunks WHERE id = ?1",
            )
            .map_err(|e| KbError::Storage(e.to_string()))?;
        for id in ids {
            if let Ok(chunk) = stmt.query_row(rusqlite::params![id.to_string()], row_to_chunk) {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    pub fn list_by_document(&self, document_id: Uuid) -> Result<Vec<TextChunk>> {
        let conn = self.conn.lock().map_err(|e| KbError::Storage(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, content, chunk_index, start_pos, end_pos,
                        word_count, embedding, created_at
                 FROM text_chunks WHERE document_id = ?1 ORDER BY chunk_index, created_at",
            )
            .map_err(|e| KbError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![document_id.to_string()], row_to_chunk)
            .map_err(|e| KbError::Storage(e.to_string()))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn ids_by_document(&self, document_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().map_err(|e| KbError::Storage(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT id FROM text_chunks WHERE document_id = ?1")
            .map_err(|e| KbError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![document_id.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| KbError::Storage(e.to_string()))?;
        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect())
    }

    /// Delete all rows for a document, returning how many were removed.
    pub fn delete_by_document(&self, document_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| KbError::Storage(e.to_string()))?;
        let removed = conn
            .execute(
                "DELETE FROM text_chunks WHERE document_id = ?1",
                rusqlite::params![document_id.to_string()],
            )
            .map_err(|e| KbError::Storage(format!("delete chunks: {e}")))?;
        Ok(removed)
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<TextChunk> {
    let id: String = row.get(0)?;
    let document_id: String = row.get(1)?;
    let created_at: String = row.get(8)?;
    Ok(TextChunk {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        document_id: Uuid::parse_str(&document_id).unwrap_or_default(),
        content: row.get(2)?,
        chunk_index: row.get(3)?,
        start_pos: row.get(4)?,
        end_pos: row.get(5)?,
        word_count: row.get(6)?,
        embedding: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbase_core::types::embedding_to_bytes;

    fn repo() -> ChunkRepository {
        ChunkRepository::open(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn chunk(document_id: Uuid, index: i64) -> TextChunk {
        TextChunk {
            id: Uuid::new_v4(),
            document_id,
            content: format!("chunk {index}"),
            chunk_index: index,
            start_pos: 0,
            end_pos: 7,
            word_count: 7,
            embedding: Some(embedding_to_bytes(&[0.5, -0.5])),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn round_trips_a_row() {
        let repo = repo();
        let doc = Uuid::new_v4();
        let c = chunk(doc, 0);
        repo.insert(&c).unwrap();

        let got = repo.get_by_ids(&[c.id]).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, c.id);
        assert_eq!(got[0].content, "chunk 0");
        assert_eq!(got[0].embedding, c.embedding);
    }

    #[test]
    fn lists_and_deletes_by_document() {
        let repo = repo();
        let doc = Uuid::new_v4();
        let other = Uuid::new_v4();
        for i in 0..3 {
            repo.insert(&chunk(doc, i)).unwrap();
        }
        repo.insert(&chunk(other, 0)).unwrap();

        let listed = repo.list_by_document(doc).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].chunk_index, 0);
        assert_eq!(listed[2].chunk_index, 2);
        assert_eq!(repo.ids_by_document(doc).unwrap().len(), 3);

        assert_eq!(repo.delete_by_document(doc).unwrap(), 3);
        assert!(repo.list_by_document(doc).unwrap().is_empty());
        assert_eq!(repo.list_by_document(other).unwrap().len(), 1);
    }

    #[test]
    fn unknown_ids_are_skipped() {
        let repo = repo();
        assert!(repo.get_by_ids(&[Uuid::new_v4()]).unwrap().is_empty());
    }
}
