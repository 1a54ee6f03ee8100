//! Commit bookkeeping for concurrently completed deliveries.
//!
//! Handlers finish in any order, but a partition's committed offset is a
//! single watermark: committing offset 7 while 5 is still running would lose 5
//! on restart. The tracker only releases the contiguous prefix of completed
//! offsets.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
struct PartitionState {
    /// Every delivered offset below this has completed.
    watermark: Option<i64>,
    highest: i64,
    pending: BTreeSet<i64>,
}

/// Tracks delivered and completed offsets per partition.
///
/// Deliveries within a partition arrive in offset order, so every delivered
/// offset below the lowest pending one is complete and the commit position is
/// either that lowest pending offset or one past the highest delivered.
#[derive(Debug, Default, Clone)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was handed to a handler.
    pub fn delivered(&mut self, partition: i32, offset: i64) {
        let state = self.partitions.entry(partition).or_default();
        let watermark = *state.watermark.get_or_insert(offset);
        if offset >= watermark {
            state.pending.insert(offset);
            state.highest = state.highest.max(offset);
        }
    }

    /// Record completion of `offset`.
    ///
    /// Returns the new commit position (the next offset to consume) when the
    /// watermark advanced, `None` when earlier offsets are still pending.
    pub fn completed(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&partition)?;
        if !state.pending.remove(&offset) {
            return None;
        }
        let previous = state.watermark?;
        let next = state.pending.first().copied().unwrap_or(state.highest + 1).max(previous);
        state.watermark = Some(next);
        (next > previous).then_some(next)
    }

    /// Commit position for `partition`, if anything was delivered there.
    pub fn watermark(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).and_then(|s| s.watermark)
    }

    /// Deliveries handed out but not completed, across partitions.
    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|s| s.pending.len()).sum()
    }

    /// Forget a partition (e.g. after it is revoked in a rebalance).
    pub fn forget(&mut self, partition: i32) {
        self.partitions.remove(&partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_completion_advances_each_time() {
        let mut tracker = OffsetTracker::new();
        tracker.delivered(0, 0);
        tracker.delivered(0, 1);
        assert_eq!(tracker.completed(0, 0), Some(1));
        assert_eq!(tracker.completed(0, 1), Some(2));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn out_of_order_completion_waits_for_the_gap() {
        let mut tracker = OffsetTracker::new();
        for offset in 10..14 {
            tracker.delivered(0, offset);
        }
        assert_eq!(tracker.completed(0, 12), None);
        assert_eq!(tracker.completed(0, 13), None);
        assert_eq!(tracker.watermark(0), Some(10));
        assert_eq!(tracker.completed(0, 10), Some(11));
        assert_eq!(tracker.completed(0, 11), Some(14));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn gaps_in_offsets_are_skipped() {
        let mut tracker = OffsetTracker::new();
        tracker.delivered(0, 3);
        tracker.delivered(0, 7);
        tracker.delivered(0, 9);
        assert_eq!(tracker.completed(0, 7), None);
        assert_eq!(tracker.completed(0, 3), Some(9));
        assert_eq!(tracker.completed(0, 9), Some(10));
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.delivered(0, 0);
        tracker.delivered(1, 0);
        assert_eq!(tracker.completed(1, 0), Some(1));
        assert_eq!(tracker.watermark(0), Some(0));
        tracker.forget(0);
        assert_eq!(tracker.watermark(0), None);
    }

    #[test]
    fn unknown_or_repeated_completion_is_ignored() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.completed(0, 5), None);
        tracker.delivered(0, 5);
        assert_eq!(tracker.completed(0, 5), Some(6));
        assert_eq!(tracker.completed(0, 5), None);
    }
}
