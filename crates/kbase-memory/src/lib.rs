//! # kbase memory
//!
//! Conversation memory (append-only per-session turn log with a 24 h TTL)
//! and the 60 s result cache, each behind a trait with two backends:
//! Redis for deployments, in-memory for tests and cache-less setups.

pub mod memory;
pub mod redis;

pub use memory::{MemoryCache, MemoryConversationStore};
pub use redis::{RedisCache, RedisConversationStore};

/// TTL applied to every session history key on append.
pub const CONVERSATION_TTL_SECS: i64 = 24 * 60 * 60;

/// Redis key for one (user, session) conversation log.
pub(crate) fn history_key(user_id: uuid::Uuid, session_id: &str) -> String {
    format!("rag:hist:{user_id}:{session_id}")
}
