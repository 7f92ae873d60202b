//! At-least-once work queue.
//!
//! ## Delivery contract
//!
//! - `receive` hands out messages and hides them for the visibility timeout; it
//!   never removes them.
//! - `delete` (acknowledge) removes a message, addressed by the receipt handle of
//!   the delivery being acknowledged.
//! - A message that is not deleted before its visibility timeout elapses becomes
//!   visible again and is redelivered, possibly to another consumer.
//!
//! Consumers must therefore be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryWorkQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsWorkQueue;

/// Queue-assigned message identifier (stable across redeliveries).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token identifying one delivery of a message; required to delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A received (in-flight) message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub receipt: ReceiptHandle,
    pub body: String,
    /// How many times this message has been handed out, including this one.
    pub receive_count: u32,
}

/// Parameters for a single receive call.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Upper bound on the batch size.
    pub max_messages: usize,
    /// How long received messages stay hidden before redelivery.
    pub visibility_timeout: Duration,
    /// Long-poll duration when nothing is available (zero = return immediately).
    pub wait_time: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            visibility_timeout: Duration::from_secs(3600),
            wait_time: Duration::ZERO,
        }
    }
}

/// Work queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("unknown or expired receipt handle: {0}")]
    UnknownReceipt(ReceiptHandle),
    #[error("queue protocol error: {0}")]
    Protocol(String),
}

impl QueueError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// At-least-once message channel with explicit acknowledgement.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message body.
    async fn send(&self, body: &str) -> Result<MessageId, QueueError>;

    /// Receive up to `options.max_messages` currently visible messages.
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a delivery, removing the message.
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;
}

#[async_trait]
impl<T: WorkQueue + ?Sized> WorkQueue for Arc<T> {
    async fn send(&self, body: &str) -> Result<MessageId, QueueError> {
        (**self).send(body).await
    }

    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError> {
        (**self).receive(options).await
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).delete(receipt).await
    }
}
