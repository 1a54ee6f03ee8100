use crate::rate_limit::Decision;
use std::time::Duration;

/// Bucket shape shared by every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Max burst and steady-state token count.
    pub capacity: u32,
    /// Milliseconds needed to regenerate one token.
    pub period_ms: u64,
}

/// One client's token bucket.
///
/// Refill is counted in whole periods and `last_refill` only advances by the
/// periods actually credited, so the fractional remainder carries over to the
/// next call instead of being dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    tokens: u32,
    last_refill: u64,
    last_seen: u64,
}

impl Bucket {
    /// A bucket created on a client's first request starts full.
    pub fn full(limits: Limits, now: u64) -> Self {
        Self { tokens: limits.capacity, last_refill: now, last_seen: now }
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Credit one token per whole period elapsed since `last_refill`, capped at capacity.
    pub fn refill(&mut self, limits: Limits, now: u64) {
        // A clock reading behind last_refill counts as no time passing.
        let elapsed = now.saturating_sub(self.last_refill);
        let periods = elapsed / limits.period_ms;
        if periods == 0 {
            return;
        }
        let credit = u32::try_from(periods).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(credit).min(limits.capacity);
        self.last_refill += periods * limits.period_ms;
    }

    /// Refill, then take one token if there is one.
    pub fn try_take(&mut self, limits: Limits, now: u64) -> Decision {
        self.refill(limits, now);
        self.last_seen = self.last_seen.max(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            Decision::Allowed { remaining: self.tokens }
        } else {
            let into_period = now.saturating_sub(self.last_refill).min(limits.period_ms);
            Decision::Denied { retry_after: Duration::from_millis(limits.period_ms - into_period) }
        }
    }
}
