//! Metric storage backends.
//!
//! Every backend implements [`MetricStorage`]. Which one a collector runs is
//! decided once, from [`StorageConfig`], by [`open_storage`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::model::{Metric, MetricPayload};
use crate::retry::Retrier;

pub mod database;
pub mod memory;

pub use database::DatabaseStorage;
pub use memory::MemoryStorage;

/// Backend-agnostic store contract.
///
/// Gauges are last-write-wins; counters sum their deltas. A batch applies
/// all of its valid entries or none of them.
#[async_trait]
pub trait MetricStorage: Send + Sync {
    /// Replace a gauge and return the stored value.
    async fn update_gauge(&self, id: &str, value: f64) -> Result<f64>;

    /// Add `delta` to a counter (starting from 0) and return the new total.
    async fn update_counter(&self, id: &str, delta: i64) -> Result<i64>;

    /// Apply a batch. Entries of unknown kind are logged and skipped; the
    /// rest are applied atomically. Returns the number of applied entries.
    async fn update_batch(&self, batch: &[MetricPayload]) -> Result<usize>;

    async fn get_gauge(&self, id: &str) -> Result<f64>;

    async fn get_counter(&self, id: &str) -> Result<i64>;

    /// Every stored record, gauges first, each group sorted by id.
    async fn list_all(&self) -> Result<Vec<Metric>>;

    /// Force a durable write of the current state.
    async fn flush(&self) -> Result<()>;

    /// Liveness probe.
    async fn check_health(&self) -> Result<()>;

    /// Release the backend, flushing whatever is not yet durable.
    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}

/// Build the backend selected by `config`.
pub async fn open_storage(
    config: &StorageConfig,
    retrier: Retrier,
) -> Result<Arc<dyn MetricStorage>> {
    match config {
        StorageConfig::Memory { path, restore } => {
            let storage = MemoryStorage::open(path.clone(), *restore).await?;
            Ok(Arc::new(storage))
        }
        StorageConfig::Database { url } => {
            let storage = DatabaseStorage::connect(url, retrier).await?;
            Ok(Arc::new(storage))
        }
    }
}

pub(crate) const LOG_TARGET: &str = "metrix::storage";
