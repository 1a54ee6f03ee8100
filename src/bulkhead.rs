//! Bulkhead limiting how many task handlers run at once.
//!
//! Unlike a fail-fast bulkhead, [`Bulkhead::acquire`] waits for a free slot:
//! the worker pool stops pulling from the topic while all slots are busy,
//! which is what keeps a burst of messages from turning into unbounded
//! concurrent handlers.

use crate::error::ConfigError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Fixed-size slot pool. Cloning shares the same slots.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    gauge: Arc<Gauge>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// A bulkhead with `max_concurrent` slots. Zero is rejected; there is no unbounded mode.
    pub fn new(max_concurrent: usize) -> Result<Self, ConfigError> {
        if max_concurrent == 0 {
            return Err(ConfigError::Zero { field: "concurrency" });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            gauge: Arc::new(Gauge { in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) }),
            max_concurrent,
        })
    }

    /// Wait for a free slot. Returns `None` once the bulkhead is closed.
    pub async fn acquire(&self) -> Option<BulkheadPermit> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        Some(self.track(permit))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.track(permit))
    }

    /// Wait up to `timeout` for every slot to be released, then close the
    /// bulkhead so no new work starts. Returns the slots still busy at the deadline.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        let drained =
            tokio::time::timeout(timeout, self.semaphore.clone().acquire_many_owned(all)).await;
        self.semaphore.close();
        match drained {
            Ok(_) => 0,
            Err(_) => self.in_flight(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.gauge.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously held slots observed.
    pub fn peak(&self) -> usize {
        self.gauge.peak.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        let now = self.gauge.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.gauge.peak.fetch_max(now, Ordering::AcqRel);
        BulkheadPermit { _permit: permit, gauge: self.gauge.clone() }
    }
}

/// A held slot; dropping it frees the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<Gauge>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.gauge.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_slots_is_a_config_error() {
        assert_eq!(Bulkhead::new(0).unwrap_err(), ConfigError::Zero { field: "concurrency" });
    }

    #[tokio::test]
    async fn try_acquire_respects_capacity() {
        let bulkhead = Bulkhead::new(2).unwrap();
        let a = bulkhead.try_acquire().unwrap();
        let _b = bulkhead.try_acquire().unwrap();
        assert!(bulkhead.try_acquire().is_none());
        assert_eq!(bulkhead.in_flight(), 2);
        drop(a);
        assert_eq!(bulkhead.in_flight(), 1);
        assert!(bulkhead.try_acquire().is_some());
        assert_eq!(bulkhead.peak(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_a_release() {
        let bulkhead = Bulkhead::new(1).unwrap();
        let held = bulkhead.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let bulkhead = bulkhead.clone();
            async move { bulkhead.acquire().await.is_some() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_holders_never_exceed_limit() {
        let bulkhead = Bulkhead::new(3).unwrap();
        let mut handles = Vec::new();
        for _ in 0..12 {
            let bulkhead = bulkhead.clone();
            handles.push(tokio::spawn(async move {
                let _slot = bulkhead.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }));
        }
        futures::future::join_all(handles).await;
        assert_eq!(bulkhead.peak(), 3);
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_then_closes() {
        let bulkhead = Bulkhead::new(2).unwrap();
        let slot = bulkhead.acquire().await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(slot);
        });
        assert_eq!(bulkhead.drain(Duration::from_secs(1)).await, 0);
        assert!(bulkhead.is_closed());
        assert!(bulkhead.acquire().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_reports_stragglers_on_timeout() {
        let bulkhead = Bulkhead::new(2).unwrap();
        let _stuck = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.drain(Duration::from_millis(10)).await, 1);
        assert!(bulkhead.is_closed());
    }
}
