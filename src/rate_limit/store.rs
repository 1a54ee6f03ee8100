use crate::rate_limit::bucket::{Bucket, Limits};
use crate::rate_limit::Decision;
use std::collections::HashMap;

/// Owns one [`Bucket`] per client key.
///
/// Plain data with no locking or I/O; [`AdmissionController`](super::AdmissionController)
/// wraps it in a mutex and supplies the time.
#[derive(Debug, Clone)]
pub struct BucketStore {
    limits: Limits,
    idle_ttl_ms: u64,
    buckets: HashMap<String, Bucket>,
}

impl BucketStore {
    pub fn new(limits: Limits, idle_ttl_ms: u64) -> Self {
        Self { limits, idle_ttl_ms, buckets: HashMap::new() }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Refill-then-take for `key`, creating a full bucket on first sight.
    pub fn decide(&mut self, key: &str, now: u64) -> Decision {
        let limits = self.limits;
        if let Some(bucket) = self.buckets.get_mut(key) {
            return bucket.try_take(limits, now);
        }
        let mut bucket = Bucket::full(limits, now);
        let decision = bucket.try_take(limits, now);
        self.buckets.insert(key.to_owned(), bucket);
        decision
    }

    /// Drop buckets untouched for at least the idle TTL. Returns how many were removed.
    pub fn evict_idle(&mut self, now: u64) -> usize {
        let ttl = self.idle_ttl_ms;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| now.saturating_sub(bucket.last_seen()) < ttl);
        before - self.buckets.len()
    }

    /// Stored token count for `key`, without refilling.
    pub fn tokens(&self, key: &str) -> Option<u32> {
        self.buckets.get(key).map(Bucket::tokens)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BucketStore {
        BucketStore::new(Limits { capacity: 2, period_ms: 100 }, 1_000)
    }

    #[test]
    fn clients_are_isolated() {
        let mut store = store();
        assert!(store.decide("a", 0).is_allowed());
        assert!(store.decide("a", 0).is_allowed());
        assert!(!store.decide("a", 0).is_allowed());
        assert_eq!(store.tokens("b"), None);
        assert!(store.decide("b", 0).is_allowed());
        assert_eq!(store.tokens("a"), Some(0));
        assert_eq!(store.tokens("b"), Some(1));
    }

    #[test]
    fn evicts_only_idle_buckets() {
        let mut store = store();
        store.decide("old", 0);
        store.decide("fresh", 900);
        assert_eq!(store.evict_idle(1_000), 1);
        assert_eq!(store.tokens("old"), None);
        assert_eq!(store.tokens("fresh"), Some(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn evicted_client_returns_with_full_bucket() {
        let mut store = store();
        store.decide("c", 0);
        store.decide("c", 0);
        store.evict_idle(5_000);
        assert!(store.is_empty());
        assert_eq!(store.decide("c", 5_000), Decision::Allowed { remaining: 1 });
    }
}
