//! In-memory backend with an optional JSON snapshot file.
//!
//! Both maps sit behind a single `RwLock`, so a batch is applied under one
//! exclusive section and readers never see half of it. The lock is never
//! held across an `.await`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{LOG_TARGET, MetricStorage};
use crate::error::{MetrixError, Result};
use crate::model::{Metric, MetricKind, MetricPayload, MetricValue, accept_valid, validate_id};

#[derive(Debug, Default, Clone)]
struct State {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

impl State {
    /// Running total of `id` after adding `delta`, without storing it.
    fn counter_after(&self, id: &str, delta: i64) -> Result<i64> {
        self.counters
            .get(id)
            .copied()
            .unwrap_or(0)
            .checked_add(delta)
            .ok_or_else(|| MetrixError::counter_overflow(id, delta))
    }

    /// Apply a whole batch, or nothing if any counter would overflow.
    fn apply_all(&mut self, metrics: &[Metric]) -> Result<()> {
        let mut totals: HashMap<&str, i64> = HashMap::new();
        for metric in metrics {
            validate_id(&metric.id)?;
            if let MetricValue::Counter(d) = metric.value {
                let current = match totals.get(metric.id.as_str()) {
                    Some(total) => *total,
                    None => self.counters.get(&metric.id).copied().unwrap_or(0),
                };
                let total = current
                    .checked_add(d)
                    .ok_or_else(|| MetrixError::counter_overflow(&metric.id, d))?;
                totals.insert(&metric.id, total);
            }
        }

        for metric in metrics {
            if let MetricValue::Gauge(v) = metric.value {
                self.gauges.insert(metric.id.clone(), v);
            }
        }
        for (id, total) in totals {
            self.counters.insert(id.to_string(), total);
        }
        Ok(())
    }

    fn to_file(&self) -> SnapshotFile {
        let mut metrics: Vec<SnapshotRecord> = Vec::with_capacity(self.len());
        for (id, value) in &self.gauges {
            metrics.push(SnapshotRecord {
                id: id.clone(),
                kind: MetricKind::Gauge,
                delta: 0,
                value: *value,
            });
        }
        for (id, delta) in &self.counters {
            metrics.push(SnapshotRecord {
                id: id.clone(),
                kind: MetricKind::Counter,
                delta: *delta,
                value: 0.0,
            });
        }
        metrics.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));
        SnapshotFile { metrics }
    }

    fn from_file(file: SnapshotFile) -> Self {
        let mut state = Self::default();
        for record in file.metrics {
            match record.kind {
                MetricKind::Gauge => {
                    state.gauges.insert(record.id, record.value);
                }
                MetricKind::Counter => {
                    state.counters.insert(record.id, record.delta);
                }
            }
        }
        state
    }

    fn len(&self) -> usize {
        self.gauges.len() + self.counters.len()
    }
}

/// On-disk document: `{"metrics":[{"id","type","delta","value"}, ...]}`.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    metrics: Vec<SnapshotRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    id: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    #[serde(default)]
    delta: i64,
    #[serde(default)]
    value: f64,
}

/// Map-backed store. With a path it can restore from and flush to a
/// snapshot file; without one it is purely volatile.
pub struct MemoryStorage {
    state: RwLock<State>,
    path: Option<PathBuf>,
    writer: tokio::sync::Mutex<()>,
}

impl MemoryStorage {
    /// Volatile store with no snapshot file.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            path: None,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Store backed by `path`. With `restore`, the last snapshot is loaded
    /// before the store is returned; a missing file yields an empty store.
    pub async fn open(path: Option<PathBuf>, restore: bool) -> Result<Self> {
        let state = match (&path, restore) {
            (Some(path), true) => read_snapshot(path).await?,
            _ => State::default(),
        };
        if let Some(path) = &path {
            log::info!(
                target: LOG_TARGET,
                "memory storage at {} ({} records restored)",
                path.display(),
                state.len()
            );
        }
        Ok(Self {
            state: RwLock::new(state),
            path,
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricStorage for MemoryStorage {
    async fn update_gauge(&self, id: &str, value: f64) -> Result<f64> {
        validate_id(id)?;
        self.write().gauges.insert(id.to_string(), value);
        Ok(value)
    }

    async fn update_counter(&self, id: &str, delta: i64) -> Result<i64> {
        validate_id(id)?;
        let mut state = self.write();
        let total = state.counter_after(id, delta)?;
        state.counters.insert(id.to_string(), total);
        Ok(total)
    }

    async fn update_batch(&self, batch: &[MetricPayload]) -> Result<usize> {
        let metrics = accept_valid(batch, LOG_TARGET);
        self.write().apply_all(&metrics)?;
        Ok(metrics.len())
    }

    async fn get_gauge(&self, id: &str) -> Result<f64> {
        self.read()
            .gauges
            .get(id)
            .copied()
            .ok_or_else(|| MetrixError::not_found(id, MetricKind::Gauge))
    }

    async fn get_counter(&self, id: &str) -> Result<i64> {
        self.read()
            .counters
            .get(id)
            .copied()
            .ok_or_else(|| MetrixError::not_found(id, MetricKind::Counter))
    }

    async fn list_all(&self) -> Result<Vec<Metric>> {
        let state = self.read();
        let mut gauges: Vec<Metric> = state
            .gauges
            .iter()
            .map(|(id, v)| Metric::gauge(id.clone(), *v))
            .collect();
        let mut counters: Vec<Metric> = state
            .counters
            .iter()
            .map(|(id, v)| Metric::counter(id.clone(), *v))
            .collect();
        drop(state);

        gauges.sort_by(|a, b| a.id.cmp(&b.id));
        counters.sort_by(|a, b| a.id.cmp(&b.id));
        gauges.extend(counters);
        Ok(gauges)
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let _writer = self.writer.lock().await;
        // Snapshot under the read lock after taking the writer mutex, so a
        // later flush can never be overtaken by an older state.
        let document = serde_json::to_vec_pretty(&self.read().to_file())
            .map_err(|e| MetrixError::Codec(format!("snapshot: {e}")))?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&target, &document))
            .await
            .map_err(|e| MetrixError::PermanentBackend(format!("flush task: {e}")))?
            .map_err(|source| MetrixError::Snapshot { path, source })
    }

    async fn check_health(&self) -> Result<()> {
        Ok(())
    }
}

/// Write to a temp file next to `path` and rename it into place.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn read_snapshot(path: &Path) -> Result<State> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!(target: LOG_TARGET, "no snapshot at {}, starting empty", path.display());
            return Ok(State::default());
        }
        Err(source) => {
            return Err(MetrixError::Snapshot {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let file: SnapshotFile = serde_json::from_slice(&bytes).map_err(|e| MetrixError::Snapshot {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    Ok(State::from_file(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gauge_is_last_write_wins() {
        let store = MemoryStorage::new();
        store.update_gauge("Alloc", 1.0).await.unwrap();
        assert_eq!(store.update_gauge("Alloc", 2.5).await.unwrap(), 2.5);
        assert_eq!(store.get_gauge("Alloc").await.unwrap(), 2.5);
    }

    #[tokio::test]
    async fn counter_sums_deltas_from_zero() {
        let store = MemoryStorage::new();
        assert_eq!(store.update_counter("PollCount", 3).await.unwrap(), 3);
        assert_eq!(store.update_counter("PollCount", -1).await.unwrap(), 2);
        assert_eq!(store.get_counter("PollCount").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn same_id_lives_in_both_kinds() {
        let store = MemoryStorage::new();
        store.update_gauge("x", 1.5).await.unwrap();
        store.update_counter("x", 4).await.unwrap();
        assert_eq!(store.get_gauge("x").await.unwrap(), 1.5);
        assert_eq!(store.get_counter("x").await.unwrap(), 4);
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_reads_are_not_found() {
        let store = MemoryStorage::new();
        assert!(store.get_gauge("nope").await.unwrap_err().is_not_found());
        assert!(store.get_counter("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn batch_with_empty_id_applies_nothing() {
        let store = MemoryStorage::new();
        let batch = vec![
            MetricPayload::from(&Metric::counter("ok", 1)),
            MetricPayload::from(&Metric::gauge("", 1.0)),
        ];
        assert!(store.update_batch(&batch).await.is_err());
        assert!(store.get_counter("ok").await.is_err());
    }

    #[tokio::test]
    async fn counter_overflow_is_rejected_and_total_kept() {
        let store = MemoryStorage::new();
        store.update_counter("c", i64::MAX).await.unwrap();

        let err = store.update_counter("c", 1).await.unwrap_err();
        assert!(matches!(err, MetrixError::InvalidMetric { .. }), "{err}");
        assert_eq!(store.get_counter("c").await.unwrap(), i64::MAX);

        // Negative overflow is caught the same way.
        store.update_counter("d", i64::MIN).await.unwrap();
        assert!(store.update_counter("d", -1).await.is_err());
        assert_eq!(store.get_counter("d").await.unwrap(), i64::MIN);
    }

    #[tokio::test]
    async fn overflowing_batch_applies_nothing() {
        let store = MemoryStorage::new();
        store.update_counter("c", i64::MAX - 1).await.unwrap();
        let batch = vec![
            MetricPayload::from(&Metric::gauge("g", 1.0)),
            MetricPayload::from(&Metric::counter("other", 3)),
            // Each entry fits alone; together they overflow.
            MetricPayload::from(&Metric::counter("c", 1)),
            MetricPayload::from(&Metric::counter("c", 1)),
        ];
        let err = store.update_batch(&batch).await.unwrap_err();
        assert!(matches!(err, MetrixError::InvalidMetric { .. }), "{err}");

        assert_eq!(store.get_counter("c").await.unwrap(), i64::MAX - 1);
        assert!(store.get_gauge("g").await.unwrap_err().is_not_found());
        assert!(store.get_counter("other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn batch_sums_repeated_counter_entries() {
        let store = MemoryStorage::new();
        store.update_counter("c", 1).await.unwrap();
        let batch = vec![
            MetricPayload::from(&Metric::counter("c", 2)),
            MetricPayload::from(&Metric::gauge("g", 1.0)),
            MetricPayload::from(&Metric::counter("c", 3)),
            MetricPayload::from(&Metric::gauge("g", 2.0)),
        ];
        assert_eq!(store.update_batch(&batch).await.unwrap(), 4);
        assert_eq!(store.get_counter("c").await.unwrap(), 6);
        assert_eq!(store.get_gauge("g").await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn snapshot_uses_zero_for_unused_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let store = MemoryStorage::open(Some(path.clone()), false).await.unwrap();
        store.update_gauge("g", 0.5).await.unwrap();
        store.update_counter("c", 7).await.unwrap();
        store.flush().await.unwrap();

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({"metrics": [
                {"id": "g", "type": "gauge", "delta": 0, "value": 0.5},
                {"id": "c", "type": "counter", "delta": 7, "value": 0.0},
            ]})
        );
    }

    #[tokio::test]
    async fn restore_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStorage::open(Some(dir.path().join("absent.json")), true)
            .await
            .unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_corrupt_file_is_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            MemoryStorage::open(Some(path), true).await,
            Err(MetrixError::Snapshot { .. })
        ));
    }

    #[tokio::test]
    async fn flush_without_path_is_noop() {
        let store = MemoryStorage::new();
        store.update_gauge("g", 1.0).await.unwrap();
        store.flush().await.unwrap();
        store.close().await.unwrap();
    }
}
