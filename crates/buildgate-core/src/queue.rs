//! Durable queue transport abstraction.
//!
//! The deferral service talks to its backing queue only through
//! [`QueueTransport`]. Implementations must provide at-least-once delivery,
//! a visibility timeout for received-but-undeleted messages, and a
//! deduplication window keyed by the caller-supplied dedup token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::Result;

/// Maximum number of messages a single receive may return.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Visibility timeout applied when a receive does not ask for one.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Window during which a repeated dedup token is silently dropped.
pub const DEDUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Declared type of a message attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    String,
    Number,
}

/// A typed message attribute. Values travel as strings regardless of type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttribute {
    pub data_type: AttributeType,
    pub value: String,
}

impl MessageAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: AttributeType::String,
            value: value.into(),
        }
    }

    pub fn number(value: i64) -> Self {
        Self {
            data_type: AttributeType::Number,
            value: value.to_string(),
        }
    }
}

pub type MessageAttributes = BTreeMap<String, MessageAttribute>;

/// A message to enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub attributes: MessageAttributes,
    /// Idempotency token; a repeat inside [`DEDUP_INTERVAL`] is dropped.
    pub deduplication_id: Option<String>,
    /// Initial delay before the message becomes visible.
    pub delay: Option<Duration>,
}

/// Parameters for a receive call.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveRequest {
    /// Capped at [`MAX_RECEIVE_BATCH`].
    pub max_messages: usize,
    /// How long returned messages stay hidden. `Some(Duration::ZERO)` leaves
    /// them immediately visible to other readers.
    pub visibility_timeout: Option<Duration>,
}

impl ReceiveRequest {
    pub fn batch(max_messages: usize) -> Self {
        Self {
            max_messages,
            visibility_timeout: None,
        }
    }

    pub fn peek(max_messages: usize) -> Self {
        Self {
            max_messages,
            visibility_timeout: Some(Duration::ZERO),
        }
    }
}

/// A message as handed out by a receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessage {
    /// Stable across deliveries.
    pub message_id: String,
    /// Valid for deleting this delivery only.
    pub receipt_handle: String,
    pub attributes: MessageAttributes,
}

/// Trait for durable queue backends.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Create the named queue if it does not exist and return its URL.
    async fn create_queue(&self, name: &str) -> Result<String>;

    /// Enqueue a message.
    async fn send(&self, queue_url: &str, message: OutgoingMessage) -> Result<()>;

    /// Receive up to `request.max_messages` visible messages.
    async fn receive(
        &self,
        queue_url: &str,
        request: ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Delete the delivery identified by `receipt_handle`.
    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;

    /// Approximate number of currently visible messages.
    async fn approximate_message_count(&self, queue_url: &str) -> Result<usize>;
}
