//! # kbase ingest
//!
//! Asynchronous document ingestion: a durable AMQP queue with a
//! dead-letter exchange/queue pair, and the at-least-once consumer that
//! drives the vector pipeline from queue payloads.

pub mod consumer;
pub mod queue;

pub use consumer::{IngestPayload, run_consumer};
pub use queue::QueueClient;
