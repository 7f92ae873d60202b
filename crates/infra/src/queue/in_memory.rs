//! In-memory work queue with visibility timeouts (tests/dev, single process).

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{MessageId, QueueError, QueueMessage, ReceiptHandle, ReceiveOptions, WorkQueue};

#[derive(Debug)]
struct Entry {
    id: MessageId,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    /// Receipt of the latest delivery; older receipts stop working once the
    /// message has been handed out again.
    receipt: Option<ReceiptHandle>,
}

/// In-memory at-least-once queue.
///
/// Mirrors the semantics of a hosted queue: receive hides messages for the
/// visibility timeout, delete needs the receipt of the current delivery, and
/// anything not deleted in time is redelivered.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    entries: Mutex<VecDeque<Entry>>,
    arrivals: Notify,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of messages not yet deleted (visible or in flight).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of messages currently hidden by a visibility timeout.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.lock().iter().filter(|e| e.visible_at > now).count()
    }

    /// Bodies of every undeleted message, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.body.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_visible(&self, options: &ReceiveOptions) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut entries = self.lock();

        entries
            .iter_mut()
            .filter(|e| e.visible_at <= now)
            .take(options.max_messages)
            .map(|e| {
                let receipt = ReceiptHandle(Uuid::new_v4().to_string());
                e.visible_at = now + options.visibility_timeout;
                e.receive_count += 1;
                e.receipt = Some(receipt.clone());
                QueueMessage {
                    message_id: e.id.clone(),
                    receipt,
                    body: e.body.clone(),
                    receive_count: e.receive_count,
                }
            })
            .collect()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn send(&self, body: &str) -> Result<MessageId, QueueError> {
        let id = MessageId(Uuid::new_v4().to_string());
        self.lock().push_back(Entry {
            id: id.clone(),
            body: body.to_string(),
            visible_at: Instant::now(),
            receive_count: 0,
            receipt: None,
        });
        self.arrivals.notify_one();
        Ok(id)
    }

    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError> {
        if options.max_messages == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + options.wait_time;
        loop {
            let batch = self.take_visible(options);
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            // Woken early by a send, or time out and return whatever is visible.
            let _ = tokio::time::timeout_at(deadline, self.arrivals.notified()).await;
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut entries = self.lock();
        let position = entries
            .iter()
            .position(|e| e.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.clone()))?;
        entries.remove(position);
        Ok(())
    }
}
