//! Prometheus metrics sink for `taskgate`.
//! Bring your own `prometheus::Registry`; metrics are registered and updated per event.
//!
//! - `taskgate_events_total{stage, event}`: every pipeline event
//! - `taskgate_task_duration_seconds{outcome}`: handler run time

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use taskgate::telemetry::{PipelineEvent, TelemetrySink};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    task_duration: HistogramVec,
}

impl PrometheusSink {
    /// Create a sink and register its metrics into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            prometheus::Opts::new("taskgate_events_total", "Pipeline events"),
            &["stage", "event"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new("taskgate_task_duration_seconds", "Task handler run time"),
            &["outcome"],
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        Ok(Self { registry, events, task_duration })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value of `taskgate_events_total{stage, event}`.
    pub fn event_count(&self, stage: &str, event: &str) -> u64 {
        self.events.with_label_values(&[stage, event]).get()
    }

    /// Observations recorded for `taskgate_task_duration_seconds{outcome}`.
    pub fn task_samples(&self, outcome: &str) -> u64 {
        self.task_duration.with_label_values(&[outcome]).get_sample_count()
    }
}

impl tower_service::Service<PipelineEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        let (stage, label) = event.labels();
        self.events.with_label_values(&[stage, label]).inc();
        if let Some(duration) = event.task_duration() {
            self.task_duration.with_label_values(&[label]).observe(duration.as_secs_f64());
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
