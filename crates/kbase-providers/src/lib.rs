//! # kbase providers
//!
//! HTTP clients for the two model backends the platform depends on: an
//! embedding endpoint and a chat-completion endpoint. Both speak the
//! OpenAI-compatible wire format, so any conforming server (OpenAI, a
//! gateway, a local inference server) works by switching the endpoint URL.

pub mod chat;
pub mod embedding;

pub use chat::OpenAiChatClient;
pub use embedding::OpenAiEmbeddingClient;
