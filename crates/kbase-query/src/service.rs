//! The RAG query service.
//!
//! Both paths share retrieval and prompt assembly: one system instruction,
//! prior conversation turns for the (user, session) in order, then a user
//! turn carrying the question plus `[chunk#i]`-labelled context. The model
//! is invoked exactly once; there is no retry at this layer. Conversation-memory
//! and cache failures are logged and swallowed; they never fail a query.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use kbase_core::error::{KbError, Result};
use kbase_core::traits::{ChatModel, ChunkRetriever, ConversationStore, ResultCache};
use kbase_core::types::{
    ConversationTurn, GenerateParams, RagQueryRequest, RagQueryResult, Role, SourceRef, TextChunk,
    Usage, truncate_chars,
};

/// TTL for cached synchronous answers.
pub const ANSWER_CACHE_TTL: Duration = Duration::from_secs(60);

/// Code-point cap on source excerpts.
const EXCERPT_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are a retrieval-augmented assistant for an \
enterprise knowledge base. Answer strictly from the provided context; if \
the context cannot answer the question, say so explicitly.";

#[derive(Clone)]
pub struct RagQueryService {
    retriever: Arc<dyn ChunkRetriever>,
    chat: Arc<dyn ChatModel>,
    memory: Option<Arc<dyn ConversationStore>>,
    cache: Option<Arc<dyn ResultCache>>,
}

impl RagQueryService {
    pub fn new(
        retriever: Arc<dyn ChunkRetriever>,
        chat: Arc<dyn ChatModel>,
        memory: Option<Arc<dyn ConversationStore>>,
        cache: Option<Arc<dyn ResultCache>>,
    ) -> Self {
        Self { retriever, chat, memory, cache }
    }

    /// Synchronous query: retrieval, one generation call, conversation
    /// memory update, answer cache write.
    pub async fn ask_sync(&self, user_id: Uuid, req: &RagQueryRequest) -> Result<RagQueryResult> {
        if req.query.trim().is_empty() {
            return Err(KbError::Validation("query is empty".into()));
        }

        let ckey = cache_key("rag", &req.query, req.limit);
        if let Some(cache) = &self.cache {
            match cache.get(&ckey).await {
                Ok(Some(answer)) => {
                    return Ok(RagQueryResult {
                        answer,
                        sources: Vec::new(),
                        usage: Usage::default(),
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("answer cache read failed: {e}"),
            }
        }

        let chunks = self.retriever.search(&req.query, req.limit).await?;
        let sources = build_sources(&chunks);
        let messages = self.build_messages(user_id, req, &chunks).await;

        let params = GenerateParams { temperature: req.temperature, max_tokens: req.max_tokens };
        let response = self.chat.generate(&messages, &params).await?;

        self.remember(user_id, &req.session_id, Role::User, &req.query).await;
        self.remember(user_id, &req.session_id, Role::Assistant, &response.content).await;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(&ckey, &response.content, ANSWER_CACHE_TTL).await {
                tracing::warn!("answer cache write failed: {e}");
            }
        }

        Ok(RagQueryResult {
            answer: response.content,
            sources,
            usage: response.usage,
        })
    }

    /// Streaming query. Fragments arrive on the first channel in model
    /// order; a retrieval or model failure is delivered once on the second
    /// and ends the stream. On clean end-of-stream the user query and the
    /// concatenated answer are persisted as two conversation turns; the
    /// answer cache is deliberately not written on this path.
    pub fn ask_stream(
        &self,
        user_id: Uuid,
        req: RagQueryRequest,
    ) -> (mpsc::Receiver<String>, mpsc::Receiver<KbError>) {
        let (out_tx, out_rx) = mpsc::channel::<String>(16);
        let (err_tx, err_rx) = mpsc::channel::<KbError>(1);
        let service = self.clone();

        tokio::spawn(async move {
            if req.query.trim().is_empty() {
                let _ = err_tx.send(KbError::Validation("query is empty".into())).await;
                return;
            }

            let chunks = match service.retriever.search(&req.query, req.limit).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    let _ = err_tx.send(e).await;
                    return;
                }
            };
            let messages = service.build_messages(user_id, &req, &chunks).await;

            let params =
                GenerateParams { temperature: req.temperature, max_tokens: req.max_tokens };
            let mut stream = match service.chat.stream(&messages, &params).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = err_tx.send(e).await;
                    return;
                }
            };

            let mut answer = String::new();
            while let Some(item) = stream.recv().await {
                match item {
                    Ok(fragment) => {
                        answer.push_str(&fragment);
                        if out_tx.send(fragment).await.is_err() {
                            // Caller cancelled; stop relaying, persist nothing.
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(e).await;
                        return;
                    }
                }
            }

            service.remember(user_id, &req.session_id, Role::User, &req.query).await;
            service.remember(user_id, &req.session_id, Role::Assistant, &answer).await;
        });

        (out_rx, err_rx)
    }

    async fn build_messages(
        &self,
        user_id: Uuid,
        req: &RagQueryRequest,
        chunks: &[TextChunk],
    ) -> Vec<ConversationTurn> {
        let mut context = String::new();
        for chunk in chunks {
            context.push_str("\n[chunk#");
            context.push_str(&chunk.chunk_index.to_string());
            context.push_str("] ");
            context.push_str(&chunk.content);
        }

        let history = self.load_history(user_id, &req.session_id).await;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ConversationTurn::new(Role::System, SYSTEM_PROMPT));
        messages.extend(history);
        messages.push(ConversationTurn::new(
            Role::User,
            format!("Question: {}\nContext:{}", req.query, context),
        ));
        messages
    }

    async fn load_history(&self, user_id: Uuid, session_id: &str) -> Vec<ConversationTurn> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        if session_id.is_empty() {
            return Vec::new();
        }
        match memory.history(user_id, session_id).await {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(%user_id, session_id, "conversation history read failed: {e}");
                Vec::new()
            }
        }
    }

    async fn remember(&self, user_id: Uuid, session_id: &str, role: Role, content: &str) {
        let Some(memory) = &self.memory else {
            return;
        };
        if session_id.is_empty() {
            return;
        }
        let turn = ConversationTurn::new(role, content);
        if let Err(e) = memory.append(user_id, session_id, &turn).await {
            tracing::warn!(%user_id, session_id, "conversation append failed: {e}");
        }
    }
}

fn build_sources(chunks: &[TextChunk]) -> Vec<SourceRef> {
    chunks
        .iter()
        .map(|chunk| SourceRef {
            id: chunk.id,
            document_id: chunk.document_id,
            chunk_index: chunk.chunk_index,
            content_excerpt: truncate_chars(&chunk.content, EXCERPT_CHARS),
        })
        .collect()
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
    use async_trait::async_trait;
    use chrono::Utc;
    use kbase_core::types::ProviderResponse;
    use kbase_memory::{MemoryCache, MemoryConversationStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRetriever {
        chunks: Vec<TextChunk>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ChunkRetriever for StubRetriever {
        async fn search(&self, _query: &str, limit: usize) -> Result<Vec<TextChunk>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(KbError::Upstream("vector backend down".into()));
            }
            Ok(self.chunks.iter().take(limit).cloned().collect())
        }
    }

    struct StubChat {
        fragments: Vec<&'static str>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for StubChat {
        async fn generate(
            &self,
            messages: &[ConversationTurn],
            _params: &GenerateParams,
        ) -> Result<ProviderResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(KbError::Upstream("model down".into()));
            }
            // Echo how many messages we saw so prompts are assertable.
            assert_eq!(messages[0].role, Role::System);
            Ok(ProviderResponse {
                content: self.fragments.concat(),
                usage: Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
            })
        }

        async fn stream(
            &self,
            _messages: &[ConversationTurn],
            _params: &GenerateParams,
        ) -> Result<mpsc::Receiver<Result<String>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(KbError::Upstream("model down".into()));
            }
            let (tx, rx) = mpsc::channel(16);
            let fragments: Vec<String> = self.fragments.iter().map(|s| s.to_string()).collect();
            tokio::spawn(async move {
                for fragment in fragments {
                    if tx.send(Ok(fragment)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn chunk(index: i64, content: &str) -> TextChunk {
        TextChunk {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            content: content.to_string(),
            chunk_index: index,
            start_pos: 0,
            end_pos: content.chars().count() as i64,
            word_count: content.chars().count() as i64,
            embedding: None,
            created_at: Utc::now(),
        }
    }

    fn request(query: &str) -> RagQueryRequest {
        RagQueryRequest {
            query: query.to_string(),
            limit: 5,
            temperature: 0.7,
            max_tokens: 256,
            session_id: "session-1".to_string(),
        }
    }

    fn service(
        retriever: StubRetriever,
        chat: StubChat,
        memory: Option<Arc<dyn ConversationStore>>,
        cache: Option<Arc<dyn ResultCache>>,
    ) -> (RagQueryService, Arc<StubRetriever>, Arc<StubChat>) {
        let retriever = Arc::new(retriever);
        let chat = Arc::new(chat);
        (
            RagQueryService::new(retriever.clone(), chat.clone(), memory, cache),
            retriever,
            chat,
        )
    }

    fn retriever_with(chunks: Vec<TextChunk>) -> StubRetriever {
        StubRetriever { chunks, calls: AtomicUsize::new(0), fail: false }
    }

    fn chat_with(fragments: Vec<&'static str>) -> StubChat {
        StubChat { fragments, calls: AtomicUsize::new(0), fail: false }
    }

    #[tokio::test]
    async fn empty_query_fails_before_any_backend_call() {
        let (svc, retriever, chat) =
            service(retriever_with(vec![]), chat_with(vec!["x"]), None, None);
        let err = svc.ask_sync(Uuid::new_v4(), &request("   ")).await.unwrap_err();
        assert!(matches!(err, KbError::Validation(_)));
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sync_answer_carries_sources_and_usage() {
        let chunks = vec![chunk(0, "policy text"), chunk(1, &"长".repeat(300))];
        let (svc, _, _) = service(
            retriever_with(chunks.clone()),
            chat_with(vec!["the ", "answer"]),
            None,
            None,
        );

        let result = svc.ask_sync(Uuid::new_v4(), &request("what policy?")).await.unwrap();
        assert_eq!(result.answer, "the answer");
        assert_eq!(result.usage.total_tokens, 15);
        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.sources[0].id, chunks[0].id);
        assert_eq!(result.sources[1].content_excerpt.chars().count(), 200);
    }

    #[tokio::test]
    async fn sync_path_writes_cache_and_memory() {
        let memory = Arc::new(MemoryConversationStore::new());
        let cache = Arc::new(MemoryCache::new());
        let user = Uuid::new_v4();
        let (svc, retriever, chat) = service(
            retriever_with(vec![chunk(0, "context")]),
            chat_with(vec!["cached answer"]),
            Some(memory.clone()),
            Some(cache.clone()),
        );

        let first = svc.ask_sync(user, &request("q")).await.unwrap();
        assert_eq!(first.answer, "cached answer");

        let turns = memory.history(user, "session-1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "q");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "cached answer");

        // Second identical query is served from the answer cache: same
        // answer, no sources, no further backend calls.
        let second = svc.ask_sync(user, &request("q")).await.unwrap();
        assert_eq!(second.answer, "cached answer");
        assert!(second.sources.is_empty());
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retrieval_failure_aborts_before_generation() {
        let (svc, _, chat) = service(
            StubRetriever { chunks: vec![], calls: AtomicUsize::new(0), fail: true },
            chat_with(vec!["never"]),
            None,
            None,
        );
        let err = svc.ask_sync(Uuid::new_v4(), &request("q")).await.unwrap_err();
        assert!(matches!(err, KbError::Upstream(_)));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn memory_failure_never_fails_the_query() {
        struct BrokenMemory;

        #[async_trait]
        impl ConversationStore for BrokenMemory {
            async fn append(&self, _: Uuid, _: &str, _: &ConversationTurn) -> Result<()> {
                Err(KbError::Cache("redis down".into()))
            }
            async fn history(&self, _: Uuid, _: &str) -> Result<Vec<ConversationTurn>> {
                Err(KbError::Cache("redis down".into()))
            }
        }

        let (svc, _, _) = service(
            retriever_with(vec![chunk(0, "ctx")]),
            chat_with(vec!["ok"]),
            Some(Arc::new(BrokenMemory)),
            None,
        );
        let result = svc.ask_sync(Uuid::new_v4(), &request("q")).await.unwrap();
        assert_eq!(result.answer, "ok");
    }

    #[tokio::test]
    async fn stream_relays_fragments_then_persists_two_turns() {
        let memory = Arc::new(MemoryConversationStore::new());
        let cache = Arc::new(MemoryCache::new());
        let user = Uuid::new_v4();
        let (svc, _, _) = service(
            retriever_with(vec![chunk(0, "a"), chunk(1, "b"), chunk(2, "c")]),
            chat_with(vec!["hello ", "world"]),
            Some(memory.clone()),
            Some(cache.clone()),
        );

        let (mut out, mut errs) = svc.ask_stream(user, request("q"));
        assert_eq!(out.recv().await.as_deref(), Some("hello "));
        assert_eq!(out.recv().await.as_deref(), Some("world"));
        assert_eq!(out.recv().await, None);
        assert!(errs.recv().await.is_none());

        let turns = memory.history(user, "session-1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "hello world");

        // The streaming path never writes the answer cache.
        let key = cache_key("rag", "q", 5);
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_surfaces_retrieval_failure_as_terminal_error() {
        let (svc, _, chat) = service(
            StubRetriever { chunks: vec![], calls: AtomicUsize::new(0), fail: true },
            chat_with(vec!["never"]),
            None,
            None,
        );
        let (mut out, mut errs) = svc.ask_stream(Uuid::new_v4(), request("q"));
        assert!(matches!(errs.recv().await, Some(KbError::Upstream(_))));
        assert_eq!(out.recv().await, None);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prior_turns_enter_the_prompt_in_order() {
        struct PromptCapture {
            seen: std::sync::Mutex<Vec<ConversationTurn>>,
        }

        #[async_trait]
        impl ChatModel for PromptCapture {
            async fn generate(
                &self,
                messages: &[ConversationTurn],
                _params: &GenerateParams,
            ) -> Result<ProviderResponse> {
                *self.seen.lock().unwrap() = messages.to_vec();
                Ok(ProviderResponse { content: "a2".into(), usage: Usage::default() })
            }
            async fn stream(
                &self,
                _: &[ConversationTurn],
                _: &GenerateParams,
            ) -> Result<mpsc::Receiver<Result<String>>> {
                unreachable!("sync test")
            }
        }

        let memory = Arc::new(MemoryConversationStore::new());
        let user = Uuid::new_v4();
        memory
            .append(user, "session-1", &ConversationTurn::new(Role::User, "q1"))
            .await
            .unwrap();
        memory
            .append(user, "session-1", &ConversationTurn::new(Role::Assistant, "a1"))
            .await
            .unwrap();

        let capture = Arc::new(PromptCapture { seen: std::sync::Mutex::new(Vec::new()) });
        let svc = RagQueryService::new(
            Arc::new(retriever_with(vec![chunk(3, "ctx")])),
            capture.clone(),
            Some(memory),
            None,
        );
        svc.ask_sync(user, &request("q2")).await.unwrap();

        let seen = capture.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].role, Role::System);
        assert_eq!(seen[1].content, "q1");
        assert_eq!(seen[2].content, "a1");
        assert!(seen[3].content.starts_with("Question: q2"));
        assert!(seen[3].content.contains("[chunk#3] ctx"));
    }
}
