use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{lock, take_failure};
use crate::queue::{
    DEDUP_INTERVAL, DEFAULT_VISIBILITY_TIMEOUT, MAX_RECEIVE_BATCH, MessageAttributes,
    OutgoingMessage, QueueTransport, ReceiveRequest, ReceivedMessage,
};
use crate::{Clock, Error, Result};

const URL_PREFIX: &str = "memory://";

/// In-memory queue with visibility timeouts and a dedup window.
///
/// Receives scan the visible messages starting from a rotating cursor, so
/// repeated zero-visibility reads walk the whole queue instead of returning
/// the same head every time.
pub struct MemoryQueue {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    failures: u32,
}

#[derive(Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    /// dedup token -> unix time it was first accepted
    dedup: HashMap<String, i64>,
    cursor: usize,
}

struct StoredMessage {
    id: String,
    receipt_handle: Option<String>,
    attributes: MessageAttributes,
    visible_at: i64,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make the next `n` calls fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        lock(&self.inner).failures = n;
    }

    /// Number of stored messages, visible or not.
    pub fn len(&self, queue_url: &str) -> usize {
        lock(&self.inner)
            .queues
            .get(queue_url)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue_url: &str) -> bool {
        self.len(queue_url) == 0
    }

    /// Enqueue raw attributes, bypassing dedup. Used to plant malformed
    /// messages.
    pub fn inject(&self, queue_url: &str, attributes: MessageAttributes) -> Result<()> {
        let now = self.clock.now_unix();
        let mut inner = lock(&self.inner);
        let queue = queue_mut(&mut inner, queue_url)?;
        queue.messages.push(StoredMessage {
            id: Uuid::new_v4().to_string(),
            receipt_handle: None,
            attributes,
            visible_at: now,
        });
        Ok(())
    }
}

fn queue_mut<'a>(inner: &'a mut Inner, queue_url: &str) -> Result<&'a mut QueueState> {
    inner
        .queues
        .get_mut(queue_url)
        .ok_or_else(|| Error::NotFound(format!("queue {}", queue_url)))
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn create_queue(&self, name: &str) -> Result<String> {
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "create_queue")?;
        let url = format!("{URL_PREFIX}{name}");
        inner.queues.entry(url.clone()).or_default();
        Ok(url)
    }

    async fn send(&self, queue_url: &str, message: OutgoingMessage) -> Result<()> {
        let now = self.clock.now_unix();
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "send")?;
        let queue = queue_mut(&mut inner, queue_url)?;

        let window = DEDUP_INTERVAL.as_secs() as i64;
        queue.dedup.retain(|_, accepted| now - *accepted < window);
        if let Some(token) = message.deduplication_id {
            if queue.dedup.contains_key(&token) {
                return Ok(());
            }
            queue.dedup.insert(token, now);
        }

        let delay = message.delay.map(|d| d.as_secs() as i64).unwrap_or(0);
        queue.messages.push(StoredMessage {
            id: Uuid::new_v4().to_string(),
            receipt_handle: None,
            attributes: message.attributes,
            visible_at: now + delay,
        });
        Ok(())
    }

    async fn receive(
        &self,
        queue_url: &str,
        request: ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = self.clock.now_unix();
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "receive")?;
        let queue = queue_mut(&mut inner, queue_url)?;

        let visible: Vec<usize> = queue
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(i, _)| i)
            .collect();
        if visible.is_empty() {
            return Ok(Vec::new());
        }

        let take = request.max_messages.min(MAX_RECEIVE_BATCH).min(visible.len());
        let start = queue.cursor % visible.len();
        queue.cursor = queue.cursor.wrapping_add(take);

        let hidden_for = request
            .visibility_timeout
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT)
            .as_secs() as i64;

        let mut out = Vec::with_capacity(take);
        for offset in 0..take {
            let index = visible[(start + offset) % visible.len()];
            let message = &mut queue.messages[index];
            let handle = Uuid::new_v4().to_string();
            message.receipt_handle = Some(handle.clone());
            message.visible_at = now + hidden_for;
            out.push(ReceivedMessage {
                message_id: message.id.clone(),
                receipt_handle: handle,
                attributes: message.attributes.clone(),
            });
        }
        Ok(out)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "delete")?;
        let queue = queue_mut(&mut inner, queue_url)?;
        queue
            .messages
            .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        Ok(())
    }

    async fn approximate_message_count(&self, queue_url: &str) -> Result<usize> {
        let now = self.clock.now_unix();
        let mut inner = lock(&self.inner);
        take_failure(&mut inner.failures, "approximate_message_count")?;
        let queue = queue_mut(&mut inner, queue_url)?;
        Ok(queue.messages.iter().filter(|m| m.visible_at <= now).count())
    }
}
