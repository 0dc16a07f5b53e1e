//! Redis backends for conversation memory and the result cache.
//!
//! History layout: one list per (user, session) under
//! `rag:hist:<user>:<session>`, entries encoded `role|content`, expiry
//! refreshed to 24 h on every append. The cache is plain `SET … EX ttl`.

use std::time::Duration;

use async_trait::async_trait;
use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use uuid::Uuid;

use kbase_core::error::{KbError, Result};
use kbase_core::traits::{ConversationStore, ResultCache};
use kbase_core::types::{ConversationTurn, Role};

use crate::{CONVERSATION_TTL_SECS, history_key};

/// Open a shared connection manager for the configured Redis URL.
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = ::redis::Client::open(url)
        .map_err(|e| KbError::Cache(format!("redis url: {e}")))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| KbError::Cache(format!("redis connect: {e}")))
}

pub struct RedisConversationStore {
    conn: ConnectionManager,
}

impl RedisConversationStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ConversationStore for RedisConversationStore {
    async fn append(&self, user_id: Uuid, session_id: &str, turn: &ConversationTurn) -> Result<()> {
        if session_id.is_empty() {
            return Ok(());
        }
        let key = history_key(user_id, session_id);
        let entry = format!("{}|{}", turn.role.as_str(), turn.content);
        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(&key, entry)
            .await
            .map_err(|e| KbError::Cache(format!("history append: {e}")))?;
        let _: () = conn
            .expire(&key, CONVERSATION_TTL_SECS)
            .await
            .map_err(|e| KbError::Cache(format!("history expire: {e}")))?;
        Ok(())
    }

    async fn history(&self, user_id: Uuid, session_id: &str) -> Result<Vec<ConversationTurn>> {
        if session_id.is_empty() {
            return Ok(Vec::new());
        }
        let key = history_key(user_id, session_id);
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .lrange(&key, 0, -1)
            .await
            .map_err(|e| KbError::Cache(format!("history read: {e}")))?;

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let (role, content) = entry.split_once('|')?;
                Some(ConversationTurn::new(Role::parse(role), content))
            })
            .collect())
    }
}

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ResultCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| KbError::Cache(format!("cache get: {e}")))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs())
            .await
            .map_err(|e| KbError::Cache(format!("cache put: {e}")))?;
        Ok(())
    }
}
