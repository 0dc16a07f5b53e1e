//! At-least-once ingestion consumer.
//!
//! One background task pulls sequentially from a single subscription;
//! throughput is bounded by the channel QoS, not by parallel consumers.
//! State machine per delivery:
//!
//! received → parse payload
//!   parse failure  → nack without requeue (dead-letter), pipeline untouched
//!   parse success  → pipeline run under a 5-minute deadline
//!     success      → ack
//!     failure      → nack without requeue (dead-letter)
//!
//! There is no consumer-driven retry loop; redelivery is the broker's
//! business, and a redelivered message produces fresh chunk ids.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use serde::Deserialize;
use tokio::sync::Notify;

use kbase_core::error::{KbError, Result};
use kbase_vector::VectorPipeline;

use crate::queue::QueueClient;

/// Deadline for one document's chunk+embed+store run.
pub const PROCESSING_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// The ingestion queue message body.
#[derive(Debug, Deserialize)]
pub struct IngestPayload {
    pub document_id: String,
    pub content: String,
    #[serde(default)]
    pub chunk_size: i64,
}

impl IngestPayload {
    pub fn parse(body: &[u8]) -> Result<IngestPayload> {
        serde_json::from_slice(body)
            .map_err(|e| KbError::Validation(format!("unparsable ingest payload: {e}")))
    }
}

/// What to do with a finished delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// Reject without requeue, routing to the dead-letter queue.
    DeadLetter,
}

/// Run the pipeline for one parsed payload and decide the delivery outcome.
pub async fn process_delivery(pipeline: &VectorPipeline, payload: &IngestPayload) -> Outcome {
    let run = tokio::time::timeout(
        PROCESSING_DEADLINE,
        pipeline.process_document(&payload.document_id, &payload.content, payload.chunk_size),
    )
    .await;

    match run {
        Ok(Ok(chunks)) => {
            tracing::info!(
                document_id = %payload.document_id,
                chunks = chunks.len(),
                "document processed"
            );
            Outcome::Ack
        }
        Ok(Err(e)) => {
            tracing::error!(document_id = %payload.document_id, "failed to process document: {e}");
            Outcome::DeadLetter
        }
        Err(_) => {
            tracing::error!(document_id = %payload.document_id, "processing deadline exceeded");
            Outcome::DeadLetter
        }
    }
}

/// Consume the ingestion queue until `shutdown` fires or the subscription
/// ends.
pub async fn run_consumer(
    client: QueueClient,
    pipeline: Arc<VectorPipeline>,
    prefetch: u16,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let mut consumer = client.consume(prefetch).await?;
    tracing::info!(queue = client.queue_name(), prefetch, "ingestion consumer started");

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("ingestion consumer stopping");
                return Ok(());
            }
            delivery = consumer.next() => {
                let Some(delivery) = delivery else {
                    tracing::warn!("ingestion subscription closed");
                    return Ok(());
                };
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::error!("consumer delivery error: {e}");
                        continue;
                    }
                };

                let outcome = match IngestPayload::parse(&delivery.data) {
                    Ok(payload) => {
                        tracing::info!(document_id = %payload.document_id, "processing document from queue");
                        process_delivery(&pipeline, &payload).await
                    }
                    Err(e) => {
                        tracing::error!("rejecting unparsable message: {e}");
                        Outcome::DeadLetter
                    }
                };

                let result = match outcome {
                    Outcome::Ack => delivery.ack(BasicAckOptions::default()).await,
                    Outcome::DeadLetter => {
                        delivery
                            .nack(BasicNackOptions { requeue: false, ..Default::default() })
                            .await
                    }
                };
                if let Err(e) = result {
                    tracing::error!("failed to settle delivery: {e}");
                }
            }
        }
    }
}
