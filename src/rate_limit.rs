//! Per-client admission control.
//!
//! This module provides the building blocks for rate limiting the ingress path:
//! - [`AdmissionController`]: decides allow/deny per client key in O(1).
//! - [`AdmissionLayer`]: Tower middleware that rejects before any downstream work.
//! - [`Decision`]: the result of a check (Allowed/Denied).
//!
//! # Architecture
//!
//! - **Math**: [`bucket::Bucket`] implements whole-period token refill.
//! - **Storage**: [`store::BucketStore`] owns one bucket per client; no locking, no I/O.
//! - **Controller**: wraps the store in a single mutex, supplies the clock and
//!   counts decisions. Idle buckets are swept by [`AdmissionController::spawn_sweeper`]
//!   or [`AdmissionController::evict_idle`], never on the decision path, so memory
//!   stays bounded by active clients while `allow` stays O(1).
//!
//! ```rust
//! use std::time::Duration;
//! use taskgate::clock::ManualClock;
//! use taskgate::config::AdmissionConfig;
//! use taskgate::rate_limit::AdmissionController;
//!
//! let clock = ManualClock::new();
//! let limiter = AdmissionController::with_clock(AdmissionConfig::default(), clock.clone()).unwrap();
//! for _ in 0..10 {
//!     assert!(limiter.allow("10.0.0.1"));
//! }
//! assert!(!limiter.allow("10.0.0.1"));
//! clock.advance(Duration::from_secs(1));
//! assert!(limiter.allow("10.0.0.1"));
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::config::AdmissionConfig;
use crate::error::ConfigError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

pub mod bucket;
pub mod middleware;
pub mod store;
pub use middleware::{AdmissionFuture, AdmissionLayer, AdmissionService};

use bucket::Limits;
use store::BucketStore;

/// The decision returned by the admission controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Tokens left after this request.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The request is rejected.
    Denied {
        /// Time until the next token is credited.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Point-in-time counters for an [`AdmissionController`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub allowed: u64,
    pub denied: u64,
    pub evicted: u64,
    pub tracked_clients: usize,
}

/// Token-bucket admission controller keyed by client.
///
/// All buckets sit behind one mutex. Each decision holds it only for the
/// refill-and-take arithmetic, so same-client calls are strictly serialized and
/// different clients contend only for that brief section.
#[derive(Debug)]
pub struct AdmissionController<C = MonotonicClock> {
    store: Mutex<BucketStore>,
    clock: C,
    sweep_interval: Duration,
    allowed: AtomicU64,
    denied: AtomicU64,
    evicted: AtomicU64,
}

impl AdmissionController<MonotonicClock> {
    pub fn new(config: AdmissionConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, MonotonicClock::default())
    }
}

impl<C: Clock> AdmissionController<C> {
    /// Build a controller reading time from `clock`.
    pub fn with_clock(config: AdmissionConfig, clock: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let limits = Limits { capacity: config.capacity, period_ms: millis(config.refill_period) };
        Ok(Self {
            store: Mutex::new(BucketStore::new(limits, millis(config.idle_ttl))),
            clock,
            sweep_interval: config.sweep_interval,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    /// Take one token for `client_key` if available.
    pub fn allow(&self, client_key: &str) -> bool {
        self.check(client_key).is_allowed()
    }

    /// Like [`allow`](Self::allow) but reports remaining tokens or the wait before the next one.
    pub fn check(&self, client_key: &str) -> Decision {
        let now = self.clock.now_millis();
        let decision = self.lock().decide(client_key, now);

        match decision {
            Decision::Allowed { .. } => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Decision::Denied { retry_after } => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(client = client_key, ?retry_after, "admission denied");
            }
        }
        decision
    }

    /// Remove buckets idle past the TTL. Returns how many were removed.
    ///
    /// A returning client gets a fresh full bucket, which holds the same tokens
    /// a kept one would (the TTL covers a full refill). Its refill schedule
    /// restarts from that call, so the next token may come up to one period
    /// later than the kept bucket would have produced it.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let mut store = self.lock();
        let removed = store.evict_idle(now);
        if removed > 0 {
            self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, remaining = store.len(), "evicted idle buckets");
        }
        removed
    }

    /// Stored tokens for `client_key` as of its last decision.
    pub fn tokens(&self, client_key: &str) -> Option<u32> {
        self.lock().tokens(client_key)
    }

    pub fn capacity(&self) -> u32 {
        self.lock().limits().capacity
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            tracked_clients: self.lock().len(),
        }
    }

    // A panic can only interrupt between whole-bucket updates, so a poisoned
    // map is still consistent.
    fn lock(&self) -> MutexGuard<'_, BucketStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock + 'static> AdmissionController<C> {
    /// Sweep idle buckets every `sweep_interval` on the current tokio runtime.
    ///
    /// The task holds a weak reference and exits once the controller is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.evict_idle();
            }
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
