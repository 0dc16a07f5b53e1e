//! AMQP topology for document ingestion.
//!
//! Connecting declares, in order: the dead-letter exchange `<queue>.dlx`
//! (direct, durable), the dead-letter queue `<queue>.dlq` bound to it with
//! the original queue name as routing key, and finally the durable main
//! queue with its dead-letter arguments pointing at the DLX. Messages a
//! consumer rejects without requeue land on the DLQ for inspection/replay.

use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};

use kbase_core::error::{KbError, Result};

pub struct QueueClient {
    channel: Channel,
    queue: String,
}

impl QueueClient {
    pub async fn connect(url: &str, queue: &str) -> Result<Self> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| KbError::Queue(format!("failed to connect to broker: {e}")))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| KbError::Queue(format!("failed to open channel: {e}")))?;

        let dlx = format!("{queue}.dlx");
        let dlq = format!("{queue}.dlq");

        channel
            .exchange_declare(
                &dlx,
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| KbError::Queue(format!("failed to declare dlx: {e}")))?;

        channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| KbError::Queue(format!("failed to declare dlq: {e}")))?;

        channel
            .queue_bind(
                &dlq,
                &dlx,
                queue, // routing key: the original queue name
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| KbError::Queue(format!("failed to bind dlq: {e}")))?;

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.clone().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(queue.into()),
        );
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                args,
            )
            .await
            .map_err(|e| KbError::Queue(format!("failed to declare queue: {e}")))?;

        Ok(Self { channel, queue: queue.to_string() })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Publish a JSON payload to the main queue.
    pub async fn publish(&self, body: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| KbError::Queue(format!("publish failed: {e}")))?
            .await
            .map_err(|e| KbError::Queue(format!("publish not confirmed: {e}")))?;
        Ok(())
    }

    /// Start a manually-acknowledged consumer. `prefetch` bounds in-flight
    /// unacknowledged deliveries on this channel.
    pub async fn consume(&self, prefetch: u16) -> Result<Consumer> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| KbError::Queue(format!("failed to set qos: {e}")))?;

        self.channel
            .basic_consume(
                &self.queue,
                "kbase-vector",
                BasicConsumeOptions { no_ack: false, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| KbError::Queue(format!("failed to start consumer: {e}")))
    }
}
