//! In-memory backends. Used by tests and by deployments running without
//! Redis; same observable semantics as the Redis backends, including TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use kbase_core::error::{KbError, Result};
use kbase_core::traits::{ConversationStore, ResultCache};
use kbase_core::types::ConversationTurn;

use crate::{CONVERSATION_TTL_SECS, history_key};

#[derive(Default)]
pub struct MemoryConversationStore {
    sessions: Mutex<HashMap<String, (Vec<ConversationTurn>, Instant)>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append(&self, user_id: Uuid, session_id: &str, turn: &ConversationTurn) -> Result<()> {
        if session_id.is_empty() {
            return Ok(());
        }
        let key = history_key(user_id, session_id);
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| KbError::Cache(e.to_string()))?;
        let deadline = Instant::now() + Duration::from_secs(CONVERSATION_TTL_SECS as u64);
        let entry = sessions.entry(key).or_insert_with(|| (Vec::new(), deadline));
        entry.0.push(turn.clone());
        entry.1 = deadline;
        Ok(())
    }

    async fn history(&self, user_id: Uuid, session_id: &str) -> Result<Vec<ConversationTurn>> {
        if session_id.is_empty() {
            return Ok(Vec::new());
        }
        let key = history_key(user_id, session_id);
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| KbError::Cache(e.to_string()))?;
        match sessions.get(&key) {
            Some((turns, expires)) if *expires > Instant::now() => Ok(turns.clone()),
            Some(_) => {
                sessions.remove(&key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| KbError::Cache(e.to_string()))?;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| KbError::Cache(e.to_string()))?;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }
}
