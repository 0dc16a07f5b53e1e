//! # kbase vector
//!
//! The ingestion side of the knowledge base: sentence-aware chunking, the
//! relational chunk repository (source of truth), a SQLite-backed vector
//! index adapter, and the pipeline service that orchestrates
//! chunk → embed → dual write plus cached similarity search.

pub mod chunker;
pub mod pipeline;
pub mod repo;
pub mod sqlite_store;

pub use pipeline::VectorPipeline;
pub use repo::ChunkRepository;
pub use sqlite_store::{SqliteVectorStore, VectorMetric};
