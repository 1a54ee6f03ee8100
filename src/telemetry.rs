//! Telemetry events for the publish/consume pipeline.
//!
//! The worker pool has no synchronous caller, so its failures are visible only
//! here and in logs. Events flow into [`TelemetrySink`] implementations, which
//! are plain `tower::Service<PipelineEvent>`s and can be composed with standard
//! tower combinators.
//!
//! - **Publish**: `Published`, `Failed`
//! - **Consume**: `ReadRetry`, `ReadFailed`
//! - **Task**: `Started`, `Completed`, `Failed`, `Panicked`, `TimedOut`
//!
//! ```rust
//! use taskgate::telemetry::{MemorySink, PipelineEvent, TaskEvent};
//! use tower::Service;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = PipelineEvent::Task(TaskEvent::Completed { duration: Duration::from_millis(5) });
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes pipeline events.
pub trait TelemetrySink:
    tower::Service<PipelineEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Longest a single emit may wait on a sink before the event is dropped.
pub const EMIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry never holds up a publish or a handler: if a sink fails, or is not
/// ready and done within [`EMIT_TIMEOUT`], the event is dropped.
pub async fn emit_best_effort<S>(sink: S, event: PipelineEvent)
where
    S: tower::Service<PipelineEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    let (stage, label) = event.labels();
    let emit = async move {
        if let Ok(mut ready_sink) = sink.ready_oneshot().await {
            let _ = ready_sink.call(event).await;
        }
    };
    if tokio::time::timeout(EMIT_TIMEOUT, emit).await.is_err() {
        tracing::debug!(stage, event = label, "telemetry sink stalled, event dropped");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Publish(PublishEvent),
    Consume(ConsumeEvent),
    Task(TaskEvent),
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishEvent {
    Published { topic: String, bytes: usize, duration: Duration },
    Failed { topic: String, kind: &'static str, duration: Duration },
}

/// Read-loop health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeEvent {
    /// A transient read error; the loop sleeps `delay` before retry `attempt`.
    ReadRetry { attempt: usize, delay: Duration },
    /// The read loop gave up.
    ReadFailed { attempts: usize },
}

/// Lifecycle of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// A slot was acquired and the handler spawned.
    Started { in_flight: usize, max_concurrency: usize },
    Completed { duration: Duration },
    Failed { duration: Duration },
    Panicked { duration: Duration },
    TimedOut { timeout: Duration },
}

impl PipelineEvent {
    /// `(stage, event)` labels, e.g. for metric dimensions.
    pub fn labels(&self) -> (&'static str, &'static str) {
        match self {
            PipelineEvent::Publish(p) => (
                "publish",
                match p {
                    PublishEvent::Published { .. } => "published",
                    PublishEvent::Failed { .. } => "failed",
                },
            ),
            PipelineEvent::Consume(c) => (
                "consume",
                match c {
                    ConsumeEvent::ReadRetry { .. } => "read_retry",
                    ConsumeEvent::ReadFailed { .. } => "read_failed",
                },
            ),
            PipelineEvent::Task(t) => (
                "task",
                match t {
                    TaskEvent::Started { .. } => "started",
                    TaskEvent::Completed { .. } => "completed",
                    TaskEvent::Failed { .. } => "failed",
                    TaskEvent::Panicked { .. } => "panicked",
                    TaskEvent::TimedOut { .. } => "timed_out",
                },
            ),
        }
    }

    /// Handler run time, for events that carry one.
    pub fn task_duration(&self) -> Option<Duration> {
        match self {
            PipelineEvent::Task(
                TaskEvent::Completed { duration }
                | TaskEvent::Failed { duration }
                | TaskEvent::Panicked { duration },
            ) => Some(*duration),
            PipelineEvent::Task(TaskEvent::TimedOut { timeout }) => Some(*timeout),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Publish(event) => write!(f, "Publish::{}", event),
            PipelineEvent::Consume(event) => write!(f, "Consume::{}", event),
            PipelineEvent::Task(event) => write!(f, "Task::{}", event),
        }
    }
}

impl fmt::Display for PublishEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishEvent::Published { topic, bytes, duration } => {
                write!(f, "Published(topic={}, bytes={}, duration={:?})", topic, bytes, duration)
            }
            PublishEvent::Failed { topic, kind, duration } => {
                write!(f, "Failed(topic={}, kind={}, duration={:?})", topic, kind, duration)
            }
        }
    }
}

impl fmt::Display for ConsumeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumeEvent::ReadRetry { attempt, delay } => {
                write!(f, "ReadRetry(#{}, delay={:?})", attempt, delay)
            }
            ConsumeEvent::ReadFailed { attempts } => write!(f, "ReadFailed(attempts={})", attempts),
        }
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEvent::Started { in_flight, max_concurrency } => {
                write!(f, "Started({}/{})", in_flight, max_concurrency)
            }
            TaskEvent::Completed { duration } => write!(f, "Completed(duration={:?})", duration),
            TaskEvent::Failed { duration } => write!(f, "Failed(duration={:?})", duration),
            TaskEvent::Panicked { duration } => write!(f, "Panicked(duration={:?})", duration),
            TaskEvent::TimedOut { timeout } => write!(f, "TimedOut(timeout={:?})", timeout),
        }
    }
}

// ============================================================================
// Built-in Telemetry Sinks
// ============================================================================

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PipelineEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PipelineEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Failures are logged at WARN, everything else at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PipelineEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        match event.labels() {
            (_, "failed" | "read_failed" | "panicked" | "timed_out") => {
                tracing::warn!(event = %event, "pipeline_event");
            }
            _ => {
                tracing::debug!(event = %event, "pipeline_event");
            }
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Useful for tests. Bounded: the oldest events are evicted past capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.lock().clone()
    }

    /// Number of stored events matching `pred`.
    pub fn count(&self, pred: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PipelineEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PipelineEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
