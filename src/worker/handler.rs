use crate::broker::Task;
use crate::error::HandlerError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Task-specific work run by the worker pool, once per delivery.
///
/// Returning an error or panicking is contained by the pool: it is logged, the
/// slot is released and the delivery is acked or left for redelivery according
/// to [`AckPolicy`](super::AckPolicy).
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: Task) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
#[derive(Debug, Clone)]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, task: Task) -> Result<(), HandlerError> {
        (self.f)(task).await
    }
}

/// Logs each payload and simulates a fixed amount of work.
///
/// Stand-in for a real job while wiring a deployment together.
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    work: Duration,
}

impl LoggingHandler {
    pub fn new(work: Duration) -> Self {
        Self { work }
    }
}

impl Default for LoggingHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, task: Task) -> Result<(), HandlerError> {
        tracing::info!(payload = %String::from_utf8_lossy(task.as_bytes()), "processing");
        tokio::time::sleep(self.work).await;
        Ok(())
    }
}
