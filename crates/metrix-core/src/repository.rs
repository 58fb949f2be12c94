//! Store facade bound to a sync policy.
//!
//! With a zero store interval every successful mutation is followed by a
//! flush; otherwise a background worker flushes on a fixed period. The two
//! modes are exclusive.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::model::{Metric, MetricKind, MetricPayload, MetricValue};
use crate::retry::Retrier;
use crate::storage::{MetricStorage, open_storage};

const LOG_TARGET: &str = "metrix::repository";

#[derive(Clone)]
pub struct Repository {
    storage: Arc<dyn MetricStorage>,
    store_interval: Duration,
}

impl Repository {
    pub fn new(storage: Arc<dyn MetricStorage>, store_interval: Duration) -> Self {
        Self {
            storage,
            store_interval,
        }
    }

    /// Open the configured backend with the default retry ladder.
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        let storage = open_storage(&config.storage, Retrier::default()).await?;
        Ok(Self::new(storage, config.store_interval))
    }

    pub fn immediate_sync(&self) -> bool {
        self.store_interval.is_zero()
    }

    pub async fn update_gauge(&self, id: &str, value: f64) -> Result<f64> {
        let stored = self
            .storage
            .update_gauge(id, value)
            .await
            .inspect_err(|e| log::warn!(target: LOG_TARGET, "update gauge {id:?} = {value}: {e}"))?;
        self.sync().await;
        Ok(stored)
    }

    pub async fn update_counter(&self, id: &str, delta: i64) -> Result<i64> {
        let total = self
            .storage
            .update_counter(id, delta)
            .await
            .inspect_err(|e| log::warn!(target: LOG_TARGET, "update counter {id:?} += {delta}: {e}"))?;
        self.sync().await;
        Ok(total)
    }

    /// Apply a typed write and return the stored record.
    pub async fn update(&self, metric: &Metric) -> Result<Metric> {
        Ok(match metric.value {
            MetricValue::Gauge(v) => Metric::gauge(&metric.id, self.update_gauge(&metric.id, v).await?),
            MetricValue::Counter(d) => {
                Metric::counter(&metric.id, self.update_counter(&metric.id, d).await?)
            }
        })
    }

    pub async fn update_batch(&self, batch: &[MetricPayload]) -> Result<usize> {
        let applied = self
            .storage
            .update_batch(batch)
            .await
            .inspect_err(|e| log::warn!(target: LOG_TARGET, "batch of {} entries: {e}", batch.len()))?;
        self.sync().await;
        Ok(applied)
    }

    pub async fn get_gauge(&self, id: &str) -> Result<f64> {
        self.storage.get_gauge(id).await
    }

    pub async fn get_counter(&self, id: &str) -> Result<i64> {
        self.storage.get_counter(id).await
    }

    /// Current record for `(id, kind)`.
    pub async fn get(&self, id: &str, kind: MetricKind) -> Result<Metric> {
        Ok(match kind {
            MetricKind::Gauge => Metric::gauge(id, self.get_gauge(id).await?),
            MetricKind::Counter => Metric::counter(id, self.get_counter(id).await?),
        })
    }

    pub async fn list_all(&self) -> Result<Vec<Metric>> {
        self.storage.list_all().await
    }

    pub async fn flush(&self) -> Result<()> {
        self.storage.flush().await
    }

    pub async fn check_health(&self) -> Result<()> {
        self.storage.check_health().await
    }

    /// Final flush and release of the backend.
    pub async fn close(&self) -> Result<()> {
        self.storage.close().await
    }

    async fn sync(&self) {
        if !self.immediate_sync() {
            return;
        }
        if let Err(e) = self.storage.flush().await {
            log::error!(target: LOG_TARGET, "flush after write: {e}");
        }
    }

    /// Flush every store interval until `shutdown` fires.
    pub async fn run_flush_loop(&self, shutdown: CancellationToken) {
        let period = self.store_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    match self.storage.flush().await {
                        Ok(()) => log::debug!(target: LOG_TARGET, "periodic flush done"),
                        Err(e) => log::error!(target: LOG_TARGET, "periodic flush: {e}"),
                    }
                }
            }
        }
    }

    /// Spawn the flush worker in deferred mode; `None` in immediate mode.
    pub fn spawn_flush_worker(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.immediate_sync() {
            return None;
        }
        let repository = self.clone();
        Some(tokio::spawn(async move {
            repository.run_flush_loop(shutdown).await;
        }))
    }
}
