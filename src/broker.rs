//! Durable topic abstraction shared by the publisher and the worker pool.
//!
//! The queue itself is an external collaborator: anything offering ordered,
//! at-least-once append logs with consumer groups can sit behind
//! [`TopicWriter`] / [`TopicReader`]. [`MemoryBroker`] is the in-process
//! implementation used in tests and single-node setups; `taskgate-kafka`
//! provides the Kafka/Redpanda one.

use crate::error::{ConsumeError, PublishError};
use async_trait::async_trait;
use std::fmt;

pub mod memory;
pub mod offsets;
pub use memory::{MemoryBroker, MemoryReader, MemoryWriter};
pub use offsets::OffsetTracker;

/// Topic every accepted task is appended to.
pub const DEFAULT_TOPIC: &str = "tasks";
/// Consumer group the worker pool reads under.
pub const DEFAULT_GROUP: &str = "workers";

/// Opaque task payload. Producer and consumer agree only on bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Task(Vec<u8>);

impl Task {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self(payload.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl From<Vec<u8>> for Task {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Task {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Task {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Task {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

/// Identifies one delivered message for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A task read from the topic, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub task: Task,
    pub receipt: Receipt,
}

/// Append side of the durable log. Shared by every publish call.
#[async_trait]
pub trait TopicWriter: Send + Sync {
    /// Durably append `payload` to `topic`; `Ok` only once the broker has it.
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// Flush pending writes and release the connection.
    async fn close(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Read side of the durable log, bound to one topic and consumer group.
///
/// Methods take `&self` so handler tasks can acknowledge while the read loop
/// keeps polling.
#[async_trait]
pub trait TopicReader: Send + Sync {
    /// Wait for the next message visible to this group.
    async fn next(&self) -> Result<Delivery, ConsumeError>;

    /// Mark a delivery processed. Unacknowledged deliveries are redelivered to
    /// the group later (after a restart or rebalance).
    async fn ack(&self, receipt: &Receipt) -> Result<(), ConsumeError>;

    /// Commit what can be committed and leave the group.
    async fn close(&self);
}

#[async_trait]
impl<W: TopicWriter + ?Sized> TopicWriter for std::sync::Arc<W> {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        (**self).append(topic, payload).await
    }

    async fn close(&self) -> Result<(), PublishError> {
        (**self).close().await
    }
}
