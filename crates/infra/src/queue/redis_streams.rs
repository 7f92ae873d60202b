//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! ## Mapping onto the queue contract
//!
//! - **send**: `XADD <stream> * body <json>`
//! - **receive**: first reclaim deliveries that have been pending longer than the
//!   visibility timeout (`XPENDING ... IDLE` + `XCLAIM`), then read new entries
//!   with `XREADGROUP ... >` (optionally blocking for `wait_time`)
//! - **delete**: `XACK` + `XDEL` of the entry id, which doubles as the receipt
//!
//! A single consumer group is shared by every worker; each process uses its own
//! consumer name. Requires Redis 6.2+ (`XPENDING` with `IDLE`).

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{MessageId, QueueError, QueueMessage, ReceiptHandle, ReceiveOptions, WorkQueue};

/// Default consumer group name.
pub const DEFAULT_GROUP: &str = "karaoke-workers";

const BODY_FIELD: &str = "body";

#[derive(Debug, Clone)]
pub struct RedisStreamsWorkQueue {
    client: redis::Client,
    stream_key: String,
    group: String,
    consumer: String,
}

impl RedisStreamsWorkQueue {
    /// Open a client for `redis_url` and ensure the consumer group exists.
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group: Option<String>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let group = group.unwrap_or_else(|| DEFAULT_GROUP.to_string());
        let consumer = format!("{group}-{}", Uuid::new_v4().simple());

        let queue = Self {
            client,
            stream_key: stream_key.into(),
            group,
            consumer,
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    /// Create the stream and consumer group if missing (idempotent).
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)
    }

    /// Claim deliveries whose visibility timeout has elapsed.
    async fn reclaim_expired(
        &self,
        conn: &mut MultiplexedConnection,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let idle_ms = options.visibility_timeout.as_millis().max(1).to_string();

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(&idle_ms)
            .arg("-")
            .arg("+")
            .arg(options.max_messages)
            .query_async(conn)
            .await
            .map_err(map_redis_error)?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let deliveries: HashMap<String, usize> = pending
            .ids
            .iter()
            .map(|p| (p.id.clone(), p.times_delivered))
            .collect();

        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(&idle_ms);
        for id in deliveries.keys() {
            claim.arg(id);
        }

        let claimed: StreamClaimReply = claim.query_async(conn).await.map_err(map_redis_error)?;

        let messages: Vec<_> = claimed
            .ids
            .iter()
            .map(|entry| {
                let previous = deliveries.get(&entry.id).copied().unwrap_or(0);
                to_message(entry, previous as u32 + 1)
            })
            .collect();

        if !messages.is_empty() {
            debug!(
                stream = %self.stream_key,
                reclaimed = messages.len(),
                "reclaimed messages past their visibility timeout"
            );
        }
        Ok(messages)
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        count: usize,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut read = redis::cmd("XREADGROUP");
        read.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count);
        if !options.wait_time.is_zero() {
            read.arg("BLOCK").arg(options.wait_time.as_millis().to_string());
        }
        read.arg("STREAMS").arg(&self.stream_key).arg(">");

        // Nil reply when nothing arrived (or BLOCK timed out).
        let reply: Option<StreamReadReply> = read.query_async(conn).await.map_err(map_redis_error)?;

        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| to_message(&entry, 1))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl WorkQueue for RedisStreamsWorkQueue {
    #[instrument(skip(self, body), fields(stream = %self.stream_key), err)]
    async fn send(&self, body: &str) -> Result<MessageId, QueueError> {
        let mut conn = self.connection().await?;
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(MessageId(id))
    }

    #[instrument(skip(self, options), fields(stream = %self.stream_key, consumer = %self.consumer), err)]
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError> {
        if options.max_messages == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut messages = self.reclaim_expired(&mut conn, options).await?;

        let remaining = options.max_messages.saturating_sub(messages.len());
        if remaining > 0 {
            // Only block when there is nothing to hand out yet.
            let read_options = if messages.is_empty() {
                options.clone()
            } else {
                ReceiveOptions {
                    wait_time: std::time::Duration::ZERO,
                    ..options.clone()
                }
            };
            messages.extend(self.read_new(&mut conn, remaining, &read_options).await?);
        }

        Ok(messages)
    }

    #[instrument(skip(self), fields(stream = %self.stream_key), err)]
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;

        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&receipt.0)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&receipt.0)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if acked == 0 {
            return Err(QueueError::UnknownReceipt(receipt.clone()));
        }
        Ok(())
    }
}

fn to_message(entry: &StreamId, receive_count: u32) -> QueueMessage {
    QueueMessage {
        message_id: MessageId(entry.id.clone()),
        receipt: ReceiptHandle(entry.id.clone()),
        // A missing body surfaces later as a malformed message.
        body: entry.get::<String>(BODY_FIELD).unwrap_or_default(),
        receive_count,
    }
}

fn map_redis_error(e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        QueueError::unavailable(e.to_string())
    } else {
        QueueError::Protocol(e.to_string())
    }
}
