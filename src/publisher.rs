//! Durable hand-off of accepted tasks to the topic.
//!
//! `publish` either returns once the broker has the payload or fails with a
//! [`PublishError`]. It never retries on its own; retry is a caller policy, and
//! [`TaskPublisher::publish_with_retry`] is the opt-in helper for it.
//!
//! ```rust
//! use taskgate::broker::MemoryBroker;
//! use taskgate::config::PublisherConfig;
//! use taskgate::publisher::TaskPublisher;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker = MemoryBroker::new();
//! let publisher = TaskPublisher::new(broker.writer(), PublisherConfig::default()).unwrap();
//! publisher.publish("do work").await.unwrap();
//! assert_eq!(broker.messages("tasks"), vec![b"do work".to_vec()]);
//! # }
//! ```

use crate::backoff::Backoff;
use crate::broker::{Task, TopicWriter};
use crate::config::PublisherConfig;
use crate::error::{ConfigError, PublishError};
use crate::telemetry::{emit_best_effort, NullSink, PipelineEvent, PublishEvent, TelemetrySink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Appends task payloads to one topic through a shared writer handle.
#[derive(Debug)]
pub struct TaskPublisher<W, S = NullSink> {
    writer: W,
    topic: String,
    timeout: Duration,
    sink: S,
    closed: AtomicBool,
}

impl<W: TopicWriter> TaskPublisher<W, NullSink> {
    pub fn new(writer: W, config: PublisherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            writer,
            topic: config.topic,
            timeout: config.publish_timeout,
            sink: NullSink,
            closed: AtomicBool::new(false),
        })
    }
}

impl<W, S> TaskPublisher<W, S>
where
    W: TopicWriter,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Route publish outcomes to `sink`.
    pub fn with_sink<S2: TelemetrySink>(self, sink: S2) -> TaskPublisher<W, S2> {
        TaskPublisher {
            writer: self.writer,
            topic: self.topic,
            timeout: self.timeout,
            sink,
            closed: self.closed,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Durably append one task.
    pub async fn publish(&self, payload: impl Into<Task>) -> Result<(), PublishError> {
        let task = payload.into();
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }

        let started = Instant::now();
        let result =
            match tokio::time::timeout(self.timeout, self.writer.append(&self.topic, task.as_bytes()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PublishError::Timeout(self.timeout)),
            };
        let duration = started.elapsed();

        let event = match &result {
            Ok(()) => {
                tracing::debug!(topic = %self.topic, bytes = task.len(), ?duration, "task published");
                PublishEvent::Published { topic: self.topic.clone(), bytes: task.len(), duration }
            }
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, ?duration, "publish failed");
                PublishEvent::Failed { topic: self.topic.clone(), kind: e.kind(), duration }
            }
        };
        emit_best_effort(self.sink.clone(), PipelineEvent::Publish(event)).await;
        result
    }

    /// Publish, retrying retryable failures up to `max_attempts` total attempts.
    pub async fn publish_with_retry(
        &self,
        payload: impl Into<Task>,
        backoff: &Backoff,
        max_attempts: usize,
    ) -> Result<(), PublishError> {
        let task = payload.into();
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.publish(task.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff.jittered_delay(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "retrying publish");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Flush and close the writer. Later publishes fail with [`PublishError::Closed`].
    pub async fn close(&self) -> Result<(), PublishError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::telemetry::MemorySink;
    use async_trait::async_trait;

    /// Writer that never completes.
    struct Stalled;

    #[async_trait]
    impl TopicWriter for Stalled {
        async fn append(&self, _topic: &str, _payload: &[u8]) -> Result<(), PublishError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn publishes_to_configured_topic() {
        let broker = MemoryBroker::new();
        let publisher =
            TaskPublisher::new(broker.writer(), PublisherConfig::default().topic("jobs")).unwrap();
        publisher.publish(vec![1u8, 2, 3]).await.unwrap();
        assert_eq!(broker.messages("jobs"), vec![vec![1, 2, 3]]);
        assert!(broker.messages("tasks").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let sink = MemorySink::new();
        let config = PublisherConfig::default().publish_timeout(Duration::from_millis(250));
        let publisher = TaskPublisher::new(Stalled, config).unwrap().with_sink(sink.clone());
        let err = publisher.publish("x").await.unwrap_err();
        assert_eq!(err, PublishError::Timeout(Duration::from_millis(250)));
        assert_eq!(sink.count(|e| e.labels() == ("publish", "failed")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_helper_recovers_from_transient_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_append(PublishError::Unavailable("leader election".into()));
        broker.fail_next_append(PublishError::Timeout(Duration::from_secs(1)));
        let sink = MemorySink::new();
        let publisher = TaskPublisher::new(broker.writer(), PublisherConfig::default())
            .unwrap()
            .with_sink(sink.clone());

        let backoff = Backoff::exponential(Duration::from_millis(10));
        publisher.publish_with_retry("retry me", &backoff, 3).await.unwrap();
        assert_eq!(broker.messages("tasks"), vec![b"retry me".to_vec()]);
        assert_eq!(sink.count(|e| e.labels() == ("publish", "failed")), 2);
        assert_eq!(sink.count(|e| e.labels() == ("publish", "published")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_helper_gives_up_after_max_attempts() {
        let broker = MemoryBroker::new();
        broker.disconnect();
        let publisher = TaskPublisher::new(broker.writer(), PublisherConfig::default()).unwrap();
        let backoff = Backoff::exponential(Duration::from_millis(10));
        let err = publisher.publish_with_retry("x", &backoff, 4).await.unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
        assert!(broker.messages("tasks").is_empty());
    }

    #[tokio::test]
    async fn closed_publisher_refuses_work() {
        let broker = MemoryBroker::new();
        let publisher = TaskPublisher::new(broker.writer(), PublisherConfig::default()).unwrap();
        publisher.close().await.unwrap();
        publisher.close().await.unwrap();
        assert_eq!(publisher.publish("late").await, Err(PublishError::Closed));

        let backoff = Backoff::exponential(Duration::from_millis(1));
        assert_eq!(publisher.publish_with_retry("late", &backoff, 5).await, Err(PublishError::Closed));
    }
}
