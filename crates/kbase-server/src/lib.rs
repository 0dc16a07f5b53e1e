//! # kbase server
//!
//! HTTP delivery for both services. The reverse-proxy gateway in front of
//! these routers owns authentication, rate limiting and retries; this
//! layer consumes the verified caller identity it forwards and exposes the
//! chunk/search API (vector service) and the sync + SSE query API (query
//! service).

pub mod identity;
pub mod query_routes;
pub mod server;
pub mod vector_routes;

pub use server::{QueryState, VectorState, query_router, serve, vector_router};
