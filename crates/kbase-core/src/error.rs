//! Error taxonomy for kbase.
//!
//! The variants map one-to-one onto how failures are handled:
//! `Validation` is rejected before any side effect, `Upstream` surfaces as a
//! single failure (and dead-letters queued work), `Cache` is always
//! non-fatal at call sites, `DimensionMismatch` is fatal at startup only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    /// Malformed input rejected before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// Embedder, vector backend or LLM unreachable or erroring.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Configured embedding dimension does not match the index field.
    /// Only raised by the startup probe; never a per-request error.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Cache read/write failure. Callers log and continue.
    #[error("cache error: {0}")]
    Cache(String),

    /// Relational store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Message queue failure.
    #[error("queue error: {0}")]
    Queue(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KbError>;
