#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskgate::error::HandlerError;
use taskgate::worker::PoolMonitor;
use taskgate::{Task, TaskHandler};

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Sleep-poll until `monitor` has recorded `n` handler outcomes.
pub async fn wait_for_outcomes(monitor: &PoolMonitor, n: u64) {
    loop {
        let stats = monitor.stats();
        let done = stats.completed + stats.failed + stats.panicked + stats.timed_out;
        if done >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Handler recording concurrency and payloads, sleeping `work` per task.
#[derive(Clone, Default)]
pub struct Recorder {
    pub running: Arc<AtomicUsize>,
    pub max_seen: Arc<AtomicUsize>,
    pub seen: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    pub work: Duration,
}

impl Recorder {
    pub fn new(work: Duration) -> Self {
        Self { work, ..Self::default() }
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TaskHandler for Recorder {
    async fn handle(&self, task: Task) -> Result<(), HandlerError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        self.seen.lock().unwrap().push(task.into_bytes());
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
