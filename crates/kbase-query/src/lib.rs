//! # kbase query
//!
//! Retrieval-augmented question answering: top-k chunk retrieval, prompt
//! assembly with labelled context excerpts, per-session conversation
//! memory, a 60 s answer cache on the synchronous path, and a streaming
//! path relaying model fragments as they arrive.

pub mod remote;
pub mod service;

pub use remote::RemoteSearchClient;
pub use service::RagQueryService;
