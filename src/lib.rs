#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # taskgate
//!
//! Per-client admission control in front of a queued task pipeline.
//!
//! ## Features
//!
//! - **Token-bucket admission** keyed by client identity, with idle-bucket eviction
//! - **Tower middleware** rejecting over-limit requests before they reach the service
//! - **Task publisher** appending accepted payloads to the `tasks` topic
//! - **Bounded worker pool** consuming under the `workers` group with panic containment
//! - **Graceful shutdown** draining in-flight handlers
//! - **Pluggable brokers** behind [`TopicWriter`] / [`TopicReader`], with an in-memory one built in
//!
//! ## Quick Start
//!
//! ```rust
//! use taskgate::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let limiter = AdmissionController::new(AdmissionConfig::default()).unwrap();
//! let broker = MemoryBroker::new();
//! let publisher = TaskPublisher::new(broker.writer(), PublisherConfig::default()).unwrap();
//!
//! if limiter.allow("203.0.113.7") {
//!     publisher.publish("do work").await.unwrap();
//! }
//!
//! let pool = WorkerPool::new(
//!     broker.reader(DEFAULT_TOPIC, DEFAULT_GROUP),
//!     handler_fn(|task: Task| async move {
//!         assert_eq!(task.as_bytes(), b"do work");
//!         Ok(())
//!     }),
//!     WorkerConfig::default(),
//! )
//! .unwrap();
//! let mut monitor = pool.monitor();
//! let shutdown = pool.shutdown_handle();
//! let running = tokio::spawn(pool.run());
//!
//! while monitor.stats().acked < 1 {
//!     tokio::task::yield_now().await;
//! }
//! shutdown.shutdown();
//! assert!(monitor.wait_for(PoolState::Stopped).await);
//! assert_eq!(running.await.unwrap().unwrap().completed, 1);
//! # }
//! ```

pub mod backoff;
pub mod broker;
pub mod bulkhead;
pub mod clock;
pub mod config;
pub mod error;
pub mod prelude;
pub mod publisher;
pub mod rate_limit;
pub mod telemetry;
pub mod worker;

// Re-exports
pub use backoff::{Backoff, Jitter};
pub use broker::{Delivery, MemoryBroker, Receipt, Task, TopicReader, TopicWriter};
pub use bulkhead::Bulkhead;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AdmissionConfig, Config, PublisherConfig, WorkerConfig};
pub use error::{AdmissionError, ConfigError, ConsumeError, HandlerError, PublishError};
pub use publisher::TaskPublisher;
pub use rate_limit::{AdmissionController, AdmissionLayer, AdmissionStats, Decision};
pub use worker::{AckPolicy, PoolState, PoolStats, ShutdownHandle, TaskHandler, WorkerPool};
