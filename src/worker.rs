//! Bounded worker pool consuming the task topic.
//!
//! One read loop per pool pulls deliveries under a consumer group and hands
//! each to a [`TaskHandler`] running on its own tokio task. A [`Bulkhead`] of
//! `concurrency` slots bounds the handlers in flight; when every slot is busy
//! the loop waits for one before reading on.
//!
//! ```text
//! Idle -> Polling -> Dispatching -> Polling -> ...
//!            |  \-> Backoff -> Polling            (transient read error)
//!            \----> Draining -> Stopped           (shutdown or fatal read error)
//! ```
//!
//! ```rust
//! use std::time::Duration;
//! use taskgate::broker::MemoryBroker;
//! use taskgate::config::WorkerConfig;
//! use taskgate::worker::{handler_fn, WorkerPool};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker = MemoryBroker::new();
//! let reader = broker.reader("tasks", "workers");
//! let pool = WorkerPool::new(reader, handler_fn(|_task| async { Ok(()) }), WorkerConfig::default())
//!     .unwrap();
//! let shutdown = pool.shutdown_handle();
//! let running = tokio::spawn(pool.run());
//! shutdown.shutdown();
//! let stats = running.await.unwrap().unwrap();
//! assert_eq!(stats.received, 0);
//! # }
//! ```

use crate::backoff::{Backoff, Jitter};
use crate::broker::{Delivery, TopicReader};
use crate::bulkhead::{Bulkhead, BulkheadPermit};
use crate::config::WorkerConfig;
use crate::error::{ConfigError, ConsumeError, HandlerError};
use crate::telemetry::{
    emit_best_effort, ConsumeEvent, NullSink, PipelineEvent, TaskEvent, TelemetrySink,
};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

pub mod handler;
pub use handler::{handler_fn, FnHandler, LoggingHandler, TaskHandler};

/// What happens to a delivery whose handler failed, panicked or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Acknowledge anyway and rely on logs/telemetry. There is no task-level retry.
    #[default]
    AckOnFailure,
    /// Leave it unacknowledged so the group redelivers it.
    LeaveUnacked,
}

impl FromStr for AckPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ack" | "ack-on-failure" => Ok(Self::AckOnFailure),
            "leave-unacked" | "redeliver" => Ok(Self::LeaveUnacked),
            other => Err(format!("unknown ack policy {other:?}")),
        }
    }
}

/// Where the read loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Polling,
    Dispatching,
    Backoff,
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
    acked: AtomicU64,
    ack_failures: AtomicU64,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub timed_out: u64,
    pub acked: u64,
    pub ack_failures: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

/// Read-only view of a pool, usable while [`WorkerPool::run`] owns the pool.
#[derive(Debug, Clone)]
pub struct PoolMonitor {
    counters: Arc<Counters>,
    bulkhead: Bulkhead,
    state: watch::Receiver<PoolState>,
}

impl PoolMonitor {
    pub fn stats(&self) -> PoolStats {
        snapshot(&self.counters, &self.bulkhead)
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Wait until the pool reaches `target`. Returns `false` if the pool was dropped first.
    pub async fn wait_for(&mut self, target: PoolState) -> bool {
        self.state.wait_for(|s| *s == target).await.is_ok()
    }
}

/// Asks a running pool to stop polling and drain.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Consumes one topic under one consumer group with bounded concurrency.
pub struct WorkerPool<R, H, S = NullSink> {
    reader: Arc<R>,
    handler: Arc<H>,
    sink: S,
    config: WorkerConfig,
    bulkhead: Bulkhead,
    backoff: Backoff,
    counters: Arc<Counters>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    state: watch::Sender<PoolState>,
}

impl<R, H, S> fmt::Debug for WorkerPool<R, H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("in_flight", &self.bulkhead.in_flight())
            .finish()
    }
}

impl<R, H> WorkerPool<R, H, NullSink>
where
    R: TopicReader + 'static,
    H: TaskHandler,
{
    pub fn new(reader: R, handler: H, config: WorkerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let bulkhead = Bulkhead::new(config.concurrency)?;
        let backoff = Backoff::exponential(config.read_backoff_base)
            .with_max(config.read_backoff_max)
            .unwrap_or_else(|_| Backoff::exponential(config.read_backoff_base))
            .with_jitter(Jitter::Equal);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state, _) = watch::channel(PoolState::Idle);
        Ok(Self {
            reader: Arc::new(reader),
            handler: Arc::new(handler),
            sink: NullSink,
            config,
            bulkhead,
            backoff,
            counters: Arc::new(Counters::default()),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            state,
        })
    }
}

impl<R, H, S> WorkerPool<R, H, S>
where
    R: TopicReader + 'static,
    H: TaskHandler,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Route task and read-loop events to `sink`.
    pub fn with_sink<S2: TelemetrySink>(self, sink: S2) -> WorkerPool<R, H, S2> {
        WorkerPool {
            reader: self.reader,
            handler: self.handler,
            sink,
            config: self.config,
            bulkhead: self.bulkhead,
            backoff: self.backoff,
            counters: self.counters,
            shutdown_tx: self.shutdown_tx,
            shutdown_rx: self.shutdown_rx,
            state: self.state,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { tx: self.shutdown_tx.clone() }
    }

    pub fn monitor(&self) -> PoolMonitor {
        PoolMonitor {
            counters: self.counters.clone(),
            bulkhead: self.bulkhead.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Consume until shut down or a read error ends the loop.
    ///
    /// Returns the final stats after a graceful shutdown, or the read error
    /// that stopped the loop (after in-flight handlers were drained and the
    /// reader closed).
    pub async fn run(self) -> Result<PoolStats, ConsumeError> {
        let WorkerPool {
            reader,
            handler,
            sink,
            config,
            bulkhead,
            backoff,
            counters,
            shutdown_tx,
            shutdown_rx: mut shutdown,
            state,
        } = self;
        // Hold the sender so `changed()` only fires on an actual shutdown.
        let _shutdown_tx = shutdown_tx;

        tracing::info!(
            topic = %config.topic,
            group = %config.group,
            concurrency = config.concurrency,
            "worker pool started"
        );

        let mut failures = 0usize;
        let mut fatal = None;
        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            state.send_replace(PoolState::Polling);
            let read = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                read = reader.next() => read,
            };

            let delivery = match read {
                Ok(delivery) => {
                    failures = 0;
                    delivery
                }
                Err(e) if e.is_transient() && failures < config.max_read_retries => {
                    failures += 1;
                    let delay = backoff.jittered_delay(failures);
                    tracing::warn!(error = %e, attempt = failures, ?delay, "transient read error; backing off");
                    emit_best_effort(
                        sink.clone(),
                        PipelineEvent::Consume(ConsumeEvent::ReadRetry { attempt: failures, delay }),
                    )
                    .await;
                    state.send_replace(PoolState::Backoff);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, attempts = failures + 1, "read loop terminating");
                    emit_best_effort(
                        sink.clone(),
                        PipelineEvent::Consume(ConsumeEvent::ReadFailed { attempts: failures + 1 }),
                    )
                    .await;
                    fatal = Some(e);
                    break;
                }
            };
            counters.received.fetch_add(1, Ordering::Relaxed);

            state.send_replace(PoolState::Dispatching);
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    tracing::debug!(receipt = %delivery.receipt, "shutdown before dispatch; left unacked");
                    break;
                }
                permit = bulkhead.acquire() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };

            emit_best_effort(
                sink.clone(),
                PipelineEvent::Task(TaskEvent::Started {
                    in_flight: bulkhead.in_flight(),
                    max_concurrency: bulkhead.max_concurrent(),
                }),
            )
            .await;

            let span = tracing::info_span!(
                "task",
                topic = %delivery.receipt.topic,
                partition = delivery.receipt.partition,
                offset = delivery.receipt.offset,
            );
            let job = Job {
                reader: reader.clone(),
                handler: handler.clone(),
                sink: sink.clone(),
                counters: counters.clone(),
                ack_policy: config.ack_policy,
                timeout: config.handler_timeout,
            };
            tokio::spawn(job.run(delivery, permit).instrument(span));
        }

        state.send_replace(PoolState::Draining);
        let stragglers = bulkhead.drain(config.drain_timeout).await;
        if stragglers > 0 {
            tracing::warn!(stragglers, timeout = ?config.drain_timeout, "drain timed out; abandoning in-flight handlers");
        }
        reader.close().await;
        state.send_replace(PoolState::Stopped);

        let stats = snapshot(&counters, &bulkhead);
        tracing::info!(?stats, "worker pool stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

/// Everything one handler invocation needs, detached from the read loop.
struct Job<R, H, S> {
    reader: Arc<R>,
    handler: Arc<H>,
    sink: S,
    counters: Arc<Counters>,
    ack_policy: AckPolicy,
    timeout: Option<Duration>,
}

impl<R, H, S> Job<R, H, S>
where
    R: TopicReader + 'static,
    H: TaskHandler,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    async fn run(self, delivery: Delivery, _permit: BulkheadPermit) {
        let Delivery { task, receipt } = delivery;
        let started = Instant::now();

        let handler = self.handler.clone();
        let guarded = async move {
            match AssertUnwindSafe(handler.handle(task)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
            }
        };
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .unwrap_or_else(|_| Err(HandlerError::TimedOut(limit))),
            None => guarded.await,
        };
        let duration = started.elapsed();

        let counters = &self.counters;
        let event = match &outcome {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(?duration, "task completed");
                TaskEvent::Completed { duration }
            }
            Err(HandlerError::Failed(reason)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%reason, ?duration, "task failed");
                TaskEvent::Failed { duration }
            }
            Err(HandlerError::Panicked(message)) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(panic = %message, ?duration, "task handler panicked");
                TaskEvent::Panicked { duration }
            }
            Err(HandlerError::TimedOut(limit)) => {
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(timeout = ?limit, "task timed out");
                TaskEvent::TimedOut { timeout: *limit }
            }
        };

        if outcome.is_ok() || self.ack_policy == AckPolicy::AckOnFailure {
            match self.reader.ack(&receipt).await {
                Ok(()) => {
                    counters.acked.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.ack_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, %receipt, "ack failed; delivery may be redelivered");
                }
            }
        } else {
            tracing::debug!(%receipt, "leaving delivery unacked for redelivery");
        }

        emit_best_effort(self.sink, PipelineEvent::Task(event)).await;
    }
}

fn snapshot(counters: &Counters, bulkhead: &Bulkhead) -> PoolStats {
    PoolStats {
        received: counters.received.load(Ordering::Relaxed),
        completed: counters.completed.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        panicked: counters.panicked.load(Ordering::Relaxed),
        timed_out: counters.timed_out.load(Ordering::Relaxed),
        acked: counters.acked.load(Ordering::Relaxed),
        ack_failures: counters.ack_failures.load(Ordering::Relaxed),
        in_flight: bulkhead.in_flight(),
        peak_in_flight: bulkhead.peak(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
