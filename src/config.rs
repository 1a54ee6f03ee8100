//! Configuration for the admission controller, publisher and worker pool.
//!
//! Every section has defaults matching the reference deployment (10-token
//! buckets refilled once per second, topic `tasks`, group `workers`) and can be
//! overridden programmatically or from `TASKGATE_*` environment variables.
//!
//! ```rust
//! use std::time::Duration;
//! use taskgate::config::Config;
//!
//! let config = Config::from_lookup(|key| match key {
//!     "TASKGATE_RATE_CAPACITY" => Some("20".to_string()),
//!     "TASKGATE_WORKERS" => Some("8".to_string()),
//!     _ => None,
//! })
//! .unwrap();
//! assert_eq!(config.admission.capacity, 20);
//! assert_eq!(config.admission.refill_period, Duration::from_secs(1));
//! assert_eq!(config.worker.concurrency, 8);
//! ```

use crate::broker::{DEFAULT_GROUP, DEFAULT_TOPIC};
use crate::error::ConfigError;
use crate::worker::AckPolicy;
use std::str::FromStr;
use std::time::Duration;

const MIN_REFILL_PERIOD: Duration = Duration::from_millis(1);

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Max burst, and the steady-state cap on stored tokens.
    pub capacity: u32,
    /// Time to regenerate one token. Bucket math counts whole milliseconds,
    /// so sub-millisecond remainders are rejected.
    pub refill_period: Duration,
    /// Buckets idle this long are evicted. Must cover a full refill.
    pub idle_ttl: Duration,
    /// Tick of the background sweeper started by
    /// [`AdmissionController::spawn_sweeper`](crate::rate_limit::AdmissionController::spawn_sweeper).
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_period: Duration::from_secs(1),
            idle_ttl: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl AdmissionConfig {
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn refill_period(mut self, period: Duration) -> Self {
        self.refill_period = period;
        self
    }

    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Time for an empty bucket to refill completely.
    pub fn full_refill(&self) -> Duration {
        self.refill_period.saturating_mul(self.capacity)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Zero { field: "capacity" });
        }
        if self.refill_period < MIN_REFILL_PERIOD {
            return Err(ConfigError::TooShort {
                field: "refill_period",
                min: MIN_REFILL_PERIOD,
                actual: self.refill_period,
            });
        }
        if self.refill_period.subsec_nanos() % 1_000_000 != 0 {
            return Err(ConfigError::NotWholeMillis {
                field: "refill_period",
                actual: self.refill_period,
            });
        }
        // A bucket is only evicted once it has refilled completely.
        if self.idle_ttl < self.full_refill() {
            return Err(ConfigError::TooShort {
                field: "idle_ttl",
                min: self.full_refill(),
                actual: self.idle_ttl,
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero { field: "sweep_interval" });
        }
        Ok(())
    }
}

/// Where and how tasks are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub topic: String,
    /// Upper bound on a single durable append.
    pub publish_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { topic: DEFAULT_TOPIC.to_string(), publish_timeout: Duration::from_secs(10) }
    }
}

impl PublisherConfig {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "publish_timeout" });
        }
        Ok(())
    }
}

/// Consumer-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub topic: String,
    pub group: String,
    /// Max handlers running at once. There is no unbounded mode.
    pub concurrency: usize,
    pub ack_policy: AckPolicy,
    /// Per-task deadline; `None` lets handlers run as long as they need.
    pub handler_timeout: Option<Duration>,
    /// How long shutdown waits for in-flight handlers.
    pub drain_timeout: Duration,
    /// Consecutive transient read failures tolerated before giving up.
    pub max_read_retries: usize,
    /// First retry delay after a transient read failure.
    pub read_backoff_base: Duration,
    /// Cap on the read retry delay.
    pub read_backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            group: DEFAULT_GROUP.to_string(),
            concurrency: 16,
            ack_policy: AckPolicy::default(),
            handler_timeout: None,
            drain_timeout: Duration::from_secs(30),
            max_read_retries: 5,
            read_backoff_base: Duration::from_millis(100),
            read_backoff_max: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn max_read_retries(mut self, retries: usize) -> Self {
        self.max_read_retries = retries;
        self
    }

    pub fn read_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.read_backoff_base = base;
        self.read_backoff_max = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Zero { field: "concurrency" });
        }
        if self.handler_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Zero { field: "handler_timeout" });
        }
        if self.read_backoff_max < self.read_backoff_base {
            return Err(ConfigError::TooShort {
                field: "read_backoff_max",
                min: self.read_backoff_base,
                actual: self.read_backoff_max,
            });
        }
        Ok(())
    }
}

/// All sections together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub admission: AdmissionConfig,
    pub publisher: PublisherConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let env = Env { lookup: &lookup };

        let admission = &mut config.admission;
        env.parsed("TASKGATE_RATE_CAPACITY", &mut admission.capacity)?;
        env.millis("TASKGATE_REFILL_PERIOD_MS", &mut admission.refill_period)?;
        env.secs("TASKGATE_IDLE_TTL_SECS", &mut admission.idle_ttl)?;
        env.secs("TASKGATE_SWEEP_INTERVAL_SECS", &mut admission.sweep_interval)?;

        if let Some(topic) = lookup("TASKGATE_TOPIC") {
            config.publisher.topic = topic.clone();
            config.worker.topic = topic;
        }
        env.millis("TASKGATE_PUBLISH_TIMEOUT_MS", &mut config.publisher.publish_timeout)?;

        let worker = &mut config.worker;
        if let Some(group) = lookup("TASKGATE_GROUP") {
            worker.group = group;
        }
        env.parsed("TASKGATE_WORKERS", &mut worker.concurrency)?;
        env.parsed("TASKGATE_ACK_POLICY", &mut worker.ack_policy)?;
        if let Some(ms) = env.get::<u64>("TASKGATE_HANDLER_TIMEOUT_MS")? {
            worker.handler_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        env.millis("TASKGATE_DRAIN_TIMEOUT_MS", &mut worker.drain_timeout)?;
        env.parsed("TASKGATE_MAX_READ_RETRIES", &mut worker.max_read_retries)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.admission.validate()?;
        self.publisher.validate()?;
        self.worker.validate()
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = (self.lookup)(key) else {
            return Ok(None);
        };
        raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Parse {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
    }

    fn parsed<T>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.get(key)? {
            *slot = value;
        }
        Ok(())
    }

    fn millis(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(ms) = self.get::<u64>(key)? {
            *slot = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn secs(&self, key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(s) = self.get::<u64>(key)? {
            *slot = Duration::from_secs(s);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let config = Config::default();
        assert_eq!(config.admission.capacity, 10);
        assert_eq!(config.admission.refill_period, Duration::from_secs(1));
        assert_eq!(config.publisher.topic, "tasks");
        assert_eq!(config.worker.topic, "tasks");
        assert_eq!(config.worker.group, "workers");
        assert_eq!(config.worker.ack_policy, AckPolicy::AckOnFailure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("TASKGATE_RATE_CAPACITY", "5"),
            ("TASKGATE_REFILL_PERIOD_MS", "250"),
            ("TASKGATE_TOPIC", "jobs"),
            ("TASKGATE_GROUP", "crunchers"),
            ("TASKGATE_WORKERS", "3"),
            ("TASKGATE_ACK_POLICY", "leave-unacked"),
            ("TASKGATE_HANDLER_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();
        assert_eq!(config.admission.capacity, 5);
        assert_eq!(config.admission.refill_period, Duration::from_millis(250));
        assert_eq!(config.publisher.topic, "jobs");
        assert_eq!(config.worker.topic, "jobs");
        assert_eq!(config.worker.group, "crunchers");
        assert_eq!(config.worker.concurrency, 3);
        assert_eq!(config.worker.ack_policy, AckPolicy::LeaveUnacked);
        assert_eq!(config.worker.handler_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unparsable_values_name_the_key() {
        let err = Config::from_lookup(lookup(&[("TASKGATE_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref key, .. } if key == "TASKGATE_WORKERS"));
    }

    #[test]
    fn rejects_zero_capacity_and_concurrency() {
        let err = Config::from_lookup(lookup(&[("TASKGATE_RATE_CAPACITY", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { field: "capacity" });

        let err = WorkerConfig::default().concurrency(0).validate().unwrap_err();
        assert_eq!(err, ConfigError::Zero { field: "concurrency" });
    }

    #[test]
    fn idle_ttl_must_cover_a_full_refill() {
        let config = AdmissionConfig::default()
            .capacity(100)
            .refill_period(Duration::from_secs(10))
            .idle_ttl(Duration::from_secs(60));
        assert!(matches!(config.validate(), Err(ConfigError::TooShort { field: "idle_ttl", .. })));
        assert!(config.idle_ttl(Duration::from_secs(1000)).validate().is_ok());
    }

    #[test]
    fn sub_millisecond_refill_is_rejected() {
        let config = AdmissionConfig::default().refill_period(Duration::from_micros(10));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooShort { field: "refill_period", .. })
        ));
    }

    #[test]
    fn fractional_millisecond_refill_is_rejected() {
        let config = AdmissionConfig::default().refill_period(Duration::from_micros(1500));
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotWholeMillis {
                field: "refill_period",
                actual: Duration::from_micros(1500),
            })
        );
        assert!(config.refill_period(Duration::from_millis(2)).validate().is_ok());
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let config = AdmissionConfig::default().sweep_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::Zero { field: "sweep_interval" }));
    }
}
