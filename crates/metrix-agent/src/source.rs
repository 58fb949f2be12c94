//! Snapshot source: two samplers feeding one shared snapshot.
//!
//! The runtime sampler records process gauges, the cumulative `PollCount`
//! counter and a `RandomValue` gauge. The system sampler records memory,
//! per-CPU utilization and load averages. Each replaces only its own part
//! of the snapshot, under the write lock, after sampling is done.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use metrix_core::Metric;

use crate::probe;

pub const RUNTIME_LOG_TARGET: &str = "metrix::runtime-source";
pub const SYSTEM_LOG_TARGET: &str = "metrix::system-source";

#[derive(Debug, Default, Clone)]
struct Snapshot {
    runtime: Vec<Metric>,
    poll_count: i64,
    system: Vec<Metric>,
}

/// Latest sampled state, readable concurrently with sampling.
pub struct SnapshotSource {
    interval: Duration,
    snapshot: RwLock<Snapshot>,
    previous_cpu: Mutex<Vec<probe::CpuTimes>>,
}

impl SnapshotSource {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            snapshot: RwLock::new(Snapshot::default()),
            previous_cpu: Mutex::new(Vec::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Independent copy of the latest state. Empty before the first tick.
    pub fn get_snapshot(&self) -> Vec<Metric> {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut out = snapshot.runtime;
        if snapshot.poll_count > 0 {
            out.push(Metric::counter("PollCount", snapshot.poll_count));
        }
        out.extend(snapshot.system);
        out
    }

    /// Number of runtime samples taken so far.
    pub fn poll_count(&self) -> i64 {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .poll_count
    }

    /// One runtime sample.
    pub fn poll_runtime(&self) {
        let mut runtime = probe::runtime_gauges();
        runtime.push(Metric::gauge("RandomValue", rand::random::<f64>()));

        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.runtime = runtime;
        snapshot.poll_count += 1;
        log::debug!(
            target: RUNTIME_LOG_TARGET,
            "runtime sample #{} ({} gauges)",
            snapshot.poll_count,
            snapshot.runtime.len()
        );
    }

    /// One system sample. CPU utilization is measured against the previous
    /// system sample (against boot for the first one).
    pub fn poll_system(&self) {
        let mut system = probe::memory_gauges();

        let current = probe::read_cpu_times();
        {
            let mut previous = self
                .previous_cpu
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for (n, now) in current.iter().enumerate() {
                let earlier = previous.get(n).copied().unwrap_or_default();
                if let Some(pct) = now.utilization_since(&earlier) {
                    system.push(Metric::gauge(format!("CPUutilization{}", n + 1), pct));
                }
            }
            *previous = current;
        }

        system.extend(probe::load_gauges());

        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        log::debug!(target: SYSTEM_LOG_TARGET, "system sample ({} gauges)", system.len());
        snapshot.system = system;
    }

    /// Both samples, in order. Used when driving the source by hand.
    pub fn poll_once(&self) {
        self.poll_runtime();
        self.poll_system();
    }

    /// Start both samplers. Each stops at its next tick after `shutdown`.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let runtime = tokio::spawn(Arc::clone(self).run_ticker(
            RUNTIME_LOG_TARGET,
            shutdown.clone(),
            |s| s.poll_runtime(),
        ));
        let system = tokio::spawn(Arc::clone(self).run_ticker(
            SYSTEM_LOG_TARGET,
            shutdown,
            |s| s.poll_system(),
        ));
        vec![runtime, system]
    }

    /// Samples run on the blocking pool: procfs reads are synchronous file I/O.
    async fn run_ticker(
        self: Arc<Self>,
        target: &'static str,
        shutdown: CancellationToken,
        sample: fn(&Self),
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!(target: target, "sampling every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!(target: target, "stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let source = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || sample(&source)).await {
                        log::error!(target: target, "sample task failed: {e}");
                    }
                }
            }
        }
    }
}
