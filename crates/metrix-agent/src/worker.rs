//! Scheduled delivery workers sharing one concurrency gate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use metrix_core::{Result, Semaphore};

pub const LOG_TARGET: &str = "metrix::agent-worker";

/// One delivery attempt, run by a worker on every tick.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self) -> Result<()>;
}

/// Fixed set of workers that call a [`Reporter`] every `report_interval`.
///
/// Every report holds a slot of the shared [`Semaphore`], so at most
/// `rate_limit` deliveries are in flight across the pool.
pub struct WorkerPool {
    workers: usize,
    report_interval: Duration,
    gate: Semaphore,
    reporter: Arc<dyn Reporter>,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        report_interval: Duration,
        rate_limit: usize,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            workers,
            report_interval,
            gate: Semaphore::new(rate_limit),
            reporter,
        }
    }

    /// Start the workers. A report already in flight at shutdown finishes;
    /// a worker waiting for a slot gives up.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        log::info!(
            target: LOG_TARGET,
            "{} workers, reporting every {:?}, limit {}",
            self.workers,
            self.report_interval,
            self.gate
                .available()
                .map_or_else(|| "none".to_string(), |n| n.to_string())
        );
        (0..self.workers)
            .map(|id| {
                let gate = self.gate.clone();
                let reporter = Arc::clone(&self.reporter);
                let interval = self.report_interval;
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(id, interval, gate, reporter, shutdown))
            })
            .collect()
    }
}

async fn run_worker(
    id: usize,
    interval: Duration,
    gate: Semaphore,
    reporter: Arc<dyn Reporter>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let guard = tokio::select! {
            _ = shutdown.cancelled() => break,
            guard = gate.acquire() => guard,
        };
        if let Err(e) = reporter.report().await {
            log::warn!(target: LOG_TARGET, "worker {id}: report failed: {e}");
        }
        guard.release();
    }
    log::debug!(target: LOG_TARGET, "worker {id} stopped");
}
