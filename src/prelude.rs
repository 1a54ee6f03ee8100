//! Convenient re-exports for common taskgate types.
pub use crate::{
    backoff::{Backoff, BackoffError, Jitter, MAX_BACKOFF},
    broker::{
        Delivery, MemoryBroker, Receipt, Task, TopicReader, TopicWriter, DEFAULT_GROUP,
        DEFAULT_TOPIC,
    },
    clock::{Clock, ManualClock, MonotonicClock},
    config::{AdmissionConfig, Config, PublisherConfig, WorkerConfig},
    error::{AdmissionError, ConfigError, ConsumeError, HandlerError, PublishError},
    publisher::TaskPublisher,
    rate_limit::{AdmissionController, AdmissionLayer, AdmissionStats, Decision},
    telemetry::{LogSink, MemorySink, NullSink, PipelineEvent, TelemetrySink},
    worker::{
        handler_fn, AckPolicy, LoggingHandler, PoolMonitor, PoolState, PoolStats, ShutdownHandle,
        TaskHandler, WorkerPool,
    },
};
