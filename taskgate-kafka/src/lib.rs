//! Kafka / Redpanda brokers for `taskgate` (companion crate).
//!
//! [`KafkaTopicWriter`] appends through a `FutureProducer` and reports success
//! only after the broker acknowledged the record. [`KafkaTopicReader`] joins a
//! consumer group with auto-commit off: a record's offset is committed only
//! once it and everything before it on its partition has been acked, so
//! unacked work is redelivered after a restart or rebalance.
//!
//! ```no_run
//! use taskgate::prelude::*;
//! use taskgate_kafka::{KafkaSettings, KafkaTopicReader, KafkaTopicWriter};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = KafkaSettings::from_env()?;
//! let writer = KafkaTopicWriter::new(&settings)?;
//! let publisher = TaskPublisher::new(writer, PublisherConfig::default())?;
//! publisher.publish("do work").await?;
//!
//! let reader = KafkaTopicReader::new(&settings, DEFAULT_TOPIC, DEFAULT_GROUP)?;
//! let pool = WorkerPool::new(reader, LoggingHandler::default(), WorkerConfig::default())?;
//! pool.run().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use taskgate::broker::{Delivery, OffsetTracker, Receipt, Task, TopicReader, TopicWriter};
use taskgate::error::{ConfigError, ConsumeError, PublishError};

/// Environment variable holding the bootstrap broker list.
pub const BROKERS_ENV: &str = "REDPANDA_STRING_URL";

/// Connection settings shared by readers and writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    /// Comma-separated `host:port` list.
    pub brokers: String,
    /// How long the producer keeps retrying a record before failing it.
    pub message_timeout: Duration,
    pub session_timeout: Duration,
    /// Extra librdkafka properties, applied last.
    pub extra: Vec<(String, String)>,
}

impl KafkaSettings {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            message_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(10),
            extra: Vec::new(),
        }
    }

    /// Read the broker list from `REDPANDA_STRING_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(BROKERS_ENV) {
            Some(brokers) if !brokers.trim().is_empty() => Ok(Self::new(brokers.trim())),
            _ => Err(ConfigError::Missing { key: BROKERS_ENV.to_string() }),
        }
    }

    /// Set an arbitrary librdkafka property (e.g. SASL credentials).
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config
    }

    fn apply_extra(&self, config: &mut ClientConfig) {
        for (key, value) in &self.extra {
            config.set(key, value);
        }
    }
}

/// Appends tasks through a shared `FutureProducer`.
#[derive(Clone)]
pub struct KafkaTopicWriter {
    producer: FutureProducer,
    timeout: Duration,
}

impl std::fmt::Debug for KafkaTopicWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaTopicWriter").field("timeout", &self.timeout).finish()
    }
}

impl KafkaTopicWriter {
    pub fn new(settings: &KafkaSettings) -> Result<Self, PublishError> {
        let mut config = settings.client_config();
        config
            .set("message.timeout.ms", settings.message_timeout.as_millis().to_string())
            .set("acks", "all");
        settings.apply_extra(&mut config);
        let producer: FutureProducer =
            config.create().map_err(|e| PublishError::Unavailable(e.to_string()))?;
        Ok(Self::from_producer(producer, settings.message_timeout))
    }

    /// Wrap an existing producer.
    pub fn from_producer(producer: FutureProducer, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl TopicWriter for KafkaTopicWriter {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload);
        match self.producer.send(record, self.timeout).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(publish_error(e, self.timeout)),
        }
    }

    async fn close(&self) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;
        flushed.map_err(|e| publish_error(e, timeout))
    }
}

/// Drops offset bookkeeping for partitions this member no longer owns.
///
/// Acks arriving later for a revoked partition find nothing pending and commit
/// nothing, so the new owner's position is never overwritten.
#[derive(Debug, Clone, Default)]
struct RevocationContext {
    offsets: Arc<Mutex<OffsetTracker>>,
}

impl RevocationContext {
    fn offsets(&self) -> MutexGuard<'_, OffsetTracker> {
        self.offsets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn revoke(&self, partitions: &TopicPartitionList) {
        let mut offsets = self.offsets();
        let before = offsets.in_flight();
        for element in partitions.elements() {
            offsets.forget(element.partition());
        }
        let dropped = before - offsets.in_flight();
        tracing::info!(partitions = partitions.count(), dropped, "partitions revoked");
    }
}

impl ClientContext for RevocationContext {}

impl ConsumerContext for RevocationContext {
    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.revoke(partitions),
            Rebalance::Assign(partitions) => {
                tracing::info!(partitions = partitions.count(), "partitions assigned");
            }
            Rebalance::Error(err) => tracing::warn!(error = %err, "rebalance failed"),
        }
    }
}

/// Consumer-group reader with manual, contiguous offset commits.
pub struct KafkaTopicReader {
    consumer: StreamConsumer<RevocationContext>,
    topic: String,
    context: RevocationContext,
    closed: AtomicBool,
}

impl std::fmt::Debug for KafkaTopicReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaTopicReader").field("topic", &self.topic).finish()
    }
}

impl KafkaTopicReader {
    /// Join `group` and subscribe to `topic`.
    pub fn new(
        settings: &KafkaSettings,
        topic: impl Into<String>,
        group: &str,
    ) -> Result<Self, ConsumeError> {
        let topic = topic.into();
        let mut config = settings.client_config();
        config
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", settings.session_timeout.as_millis().to_string());
        settings.apply_extra(&mut config);

        let context = RevocationContext::default();
        let consumer: StreamConsumer<RevocationContext> =
            config.create_with_context(context.clone()).map_err(consume_error)?;
        consumer.subscribe(&[&topic]).map_err(consume_error)?;
        tracing::info!(%topic, group, "joined consumer group");
        Ok(Self { consumer, topic, context, closed: AtomicBool::new(false) })
    }

    fn offsets(&self) -> MutexGuard<'_, OffsetTracker> {
        self.context.offsets()
    }
}

#[async_trait]
impl TopicReader for KafkaTopicReader {
    async fn next(&self) -> Result<Delivery, ConsumeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsumeError::Closed);
        }
        let message = self.consumer.recv().await.map_err(consume_error)?;
        let receipt = Receipt {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };
        let task = Task::from(message.payload().unwrap_or_default());
        self.offsets().delivered(receipt.partition, receipt.offset);
        Ok(Delivery { task, receipt })
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), ConsumeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsumeError::Closed);
        }
        let Some(position) = self.offsets().completed(receipt.partition, receipt.offset) else {
            return Ok(());
        };
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&receipt.topic, receipt.partition, Offset::Offset(position))
            .map_err(consume_error)?;
        self.consumer.commit(&list, CommitMode::Async).map_err(consume_error)?;
        tracing::trace!(topic = %receipt.topic, partition = receipt.partition, position, "commit queued");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = self.offsets().in_flight();
        if pending > 0 {
            tracing::warn!(topic = %self.topic, pending, "leaving group with unacked deliveries");
        }
        self.consumer.unsubscribe();
        tracing::info!(topic = %self.topic, "left consumer group");
    }
}

fn publish_error(err: KafkaError, timeout: Duration) -> PublishError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut | RDKafkaErrorCode::RequestTimedOut) => {
            PublishError::Timeout(timeout)
        }
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => PublishError::Rejected(err.to_string()),
        _ => PublishError::Unavailable(err.to_string()),
    }
}

fn consume_error(err: KafkaError) -> ConsumeError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::UnknownMemberId,
        ) => ConsumeError::Coordination(err.to_string()),
        Some(
            RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::Authentication,
        ) => ConsumeError::Fatal(err.to_string()),
        _ if matches!(err, KafkaError::ClientCreation(_) | KafkaError::Subscription(_)) => {
            ConsumeError::Fatal(err.to_string())
        }
        _ => ConsumeError::Disconnected(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_come_from_redpanda_url() {
        let settings = KafkaSettings::from_lookup(|key| {
            (key == "REDPANDA_STRING_URL").then(|| " redpanda-0:9092,redpanda-1:9092 ".to_string())
        })
        .unwrap();
        assert_eq!(settings.brokers, "redpanda-0:9092,redpanda-1:9092");

        let err = KafkaSettings::from_lookup(|_| None).unwrap_err();
        assert_eq!(err, ConfigError::Missing { key: "REDPANDA_STRING_URL".into() });
        assert!(KafkaSettings::from_lookup(|_| Some(String::new())).is_err());
    }

    #[test]
    fn extra_properties_are_applied_last() {
        let settings = KafkaSettings::new("localhost:9092").set("bootstrap.servers", "override:9092");
        let mut config = settings.client_config();
        settings.apply_extra(&mut config);
        assert_eq!(config.get("bootstrap.servers"), Some("override:9092"));
    }

    #[test]
    fn revoked_partitions_stop_committing() {
        let context = RevocationContext::default();
        context.offsets().delivered(0, 5);
        context.offsets().delivered(1, 3);

        let mut revoked = TopicPartitionList::new();
        revoked.add_partition("tasks", 0);
        context.revoke(&revoked);

        assert_eq!(context.offsets().in_flight(), 1);
        assert_eq!(context.offsets().completed(0, 5), None);
        assert_eq!(context.offsets().completed(1, 3), Some(4));
    }

    #[test]
    fn producer_errors_map_to_publish_errors() {
        let timeout = Duration::from_secs(10);
        assert_eq!(
            publish_error(KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), timeout),
            PublishError::Timeout(timeout)
        );
        assert!(matches!(
            publish_error(KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), timeout),
            PublishError::Rejected(_)
        ));
        assert!(matches!(
            publish_error(KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown), timeout),
            PublishError::Unavailable(_)
        ));
    }

    #[test]
    fn consumer_errors_map_to_consume_errors() {
        let rebalance =
            consume_error(KafkaError::MessageConsumption(RDKafkaErrorCode::RebalanceInProgress));
        assert!(matches!(rebalance, ConsumeError::Coordination(_)));
        assert!(rebalance.is_transient());

        let denied =
            consume_error(KafkaError::MessageConsumption(RDKafkaErrorCode::GroupAuthorizationFailed));
        assert!(matches!(denied, ConsumeError::Fatal(_)));

        let down = consume_error(KafkaError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown));
        assert!(down.is_transient());
    }
}
