//! In-process broker with topics, consumer groups and fault injection.
//!
//! Each topic is a single partition (partition `0`). A group's committed
//! offset is the [`OffsetTracker`] watermark of its acknowledgements, and a new
//! reader of the group starts from it, so deliveries that were never
//! acknowledged are handed out again. A group with no committed offset starts
//! at the beginning of the topic. Run one reader per group at a time.

use crate::broker::{Delivery, OffsetTracker, Receipt, Task, TopicReader, TopicWriter};
use crate::error::{ConsumeError, PublishError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

const PARTITION: i32 = 0;

#[derive(Debug)]
struct State {
    topics: HashMap<String, Vec<Vec<u8>>>,
    committed: HashMap<(String, String), i64>,
    connected: bool,
    read_faults: VecDeque<ConsumeError>,
    write_faults: VecDeque<PublishError>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

/// Handle to an in-memory broker. Clones share the same topics.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    topics: HashMap::new(),
                    committed: HashMap::new(),
                    connected: true,
                    read_faults: VecDeque::new(),
                    write_faults: VecDeque::new(),
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// A writer handle; safe to share across publishers.
    pub fn writer(&self) -> MemoryWriter {
        MemoryWriter { broker: self.clone(), closed: AtomicBool::new(false) }
    }

    /// Join `group` on `topic`, resuming at the group's committed offset.
    pub fn reader(&self, topic: impl Into<String>, group: impl Into<String>) -> MemoryReader {
        let topic = topic.into();
        let group = group.into();
        let start = self.lock().committed.get(&(topic.clone(), group.clone())).copied().unwrap_or(0);
        MemoryReader {
            broker: self.clone(),
            topic,
            group,
            cursor: Mutex::new(Cursor { next: start, tracker: OffsetTracker::new() }),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }

    /// Snapshot of every payload appended to `topic`.
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// The group's committed position (next offset to consume).
    pub fn committed(&self, topic: &str, group: &str) -> Option<i64> {
        self.lock().committed.get(&(topic.to_string(), group.to_string())).copied()
    }

    /// Sever the connection: appends fail and reads report a disconnect.
    pub fn disconnect(&self) {
        self.lock().connected = false;
        self.shared.changed.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.lock().connected = true;
        self.shared.changed.notify_waiters();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Make the next read (by any reader) fail with `err`.
    pub fn fail_next_read(&self, err: ConsumeError) {
        self.lock().read_faults.push_back(err);
        self.shared.changed.notify_waiters();
    }

    /// Make the next append fail with `err`.
    pub fn fail_next_append(&self, err: PublishError) {
        self.lock().write_faults.push_back(err);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Append handle from [`MemoryBroker::writer`].
#[derive(Debug)]
pub struct MemoryWriter {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl TopicWriter for MemoryWriter {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }
        {
            let mut state = self.broker.lock();
            if let Some(err) = state.write_faults.pop_front() {
                return Err(err);
            }
            if !state.connected {
                return Err(PublishError::Unavailable("broker connection severed".into()));
            }
            state.topics.entry(topic.to_string()).or_default().push(payload.to_vec());
        }
        self.broker.shared.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
struct Cursor {
    next: i64,
    tracker: OffsetTracker,
}

/// Consumer-group reader from [`MemoryBroker::reader`].
#[derive(Debug)]
pub struct MemoryReader {
    broker: MemoryBroker,
    topic: String,
    group: String,
    cursor: Mutex<Cursor>,
    closed: AtomicBool,
    closing: Notify,
}

impl MemoryReader {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_once(&self) -> Option<Result<Delivery, ConsumeError>> {
        let mut state = self.broker.lock();
        if let Some(err) = state.read_faults.pop_front() {
            return Some(Err(err));
        }
        if !state.connected {
            return Some(Err(ConsumeError::Disconnected("broker connection severed".into())));
        }
        let log = state.topics.get(&self.topic)?;
        let mut cursor = self.cursor();
        let payload = usize::try_from(cursor.next).ok().and_then(|i| log.get(i))?.clone();
        let offset = cursor.next;
        cursor.next += 1;
        cursor.tracker.delivered(PARTITION, offset);
        Some(Ok(Delivery {
            task: Task::from(payload),
            receipt: Receipt { topic: self.topic.clone(), partition: PARTITION, offset },
        }))
    }
}

#[async_trait]
impl TopicReader for MemoryReader {
    async fn next(&self) -> Result<Delivery, ConsumeError> {
        loop {
            let changed = self.broker.shared.changed.notified();
            let closing = self.closing.notified();
            tokio::pin!(changed, closing);
            changed.as_mut().enable();
            closing.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(ConsumeError::Closed);
            }
            if let Some(result) = self.poll_once() {
                return result;
            }
            tokio::select! {
                _ = &mut changed => {}
                _ = &mut closing => {}
            }
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), ConsumeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsumeError::Closed);
        }
        let mut state = self.broker.lock();
        if !state.connected {
            return Err(ConsumeError::Disconnected("broker connection severed".into()));
        }
        let Some(position) = self.cursor().tracker.completed(receipt.partition, receipt.offset)
        else {
            return Ok(());
        };
        let committed =
            state.committed.entry((self.topic.clone(), self.group.clone())).or_insert(0);
        *committed = (*committed).max(position);
        tracing::trace!(topic = %self.topic, group = %self.group, position, "committed offset");
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closing.notify_waiters();
    }
}
