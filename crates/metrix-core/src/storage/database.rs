//! SQLite backend.
//!
//! Every write is durable on return, so `flush` has nothing to do. All
//! statements run through the [`Retrier`]; only connection-class failures
//! are retried.

use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use super::{LOG_TARGET, MetricStorage};
use crate::error::{MetrixError, Result, is_transient_sqlx};
use crate::model::{Metric, MetricKind, MetricPayload, MetricValue, accept_valid, validate_id};
use crate::retry::Retrier;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Batch ids older than this are pruned; a retry lands well within it.
const BATCH_ID_RETENTION_SECS: i64 = 3600;

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS metrics (
        id TEXT NOT NULL CHECK (length(id) > 0),
        kind TEXT NOT NULL CHECK (kind IN ('gauge', 'counter')),
        gauge_value REAL NOT NULL DEFAULT 0,
        counter_value INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (id, kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS applied_batches (
        batch_id TEXT PRIMARY KEY,
        applied_at INTEGER NOT NULL
    )
    "#,
];

const UPSERT_GAUGE: &str = r#"
    INSERT INTO metrics (id, kind, gauge_value) VALUES (?, ?, ?)
    ON CONFLICT (id, kind) DO UPDATE SET gauge_value = excluded.gauge_value
    RETURNING gauge_value
"#;

// SQLite turns an overflowing integer sum into a REAL. The WHERE clause skips
// the update in that case, so no row is returned and the stored total stays.
const UPSERT_COUNTER: &str = r#"
    INSERT INTO metrics (id, kind, counter_value) VALUES (?, ?, ?)
    ON CONFLICT (id, kind) DO UPDATE SET counter_value = metrics.counter_value + excluded.counter_value
    WHERE typeof(metrics.counter_value + excluded.counter_value) = 'integer'
    RETURNING counter_value
"#;

/// Relational store over a SQLite pool.
#[derive(Clone)]
pub struct DatabaseStorage {
    pool: SqlitePool,
    retrier: Retrier,
}

impl DatabaseStorage {
    /// Connect to `url` (a path, `sqlite://path` or `:memory:`) and create
    /// the schema when missing.
    pub async fn connect(url: &str, retrier: Retrier) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MetrixError::Config(format!("database dsn {url:?}: {e}")))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        // Every connection to an in-memory database is a separate database.
        let in_memory = url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = retrier
            .exec(
                || pool_options.clone().connect_with(options.clone()),
                is_transient_sqlx,
            )
            .await?;

        let storage = Self { pool, retrier };
        storage.migrate().await?;
        log::info!(target: LOG_TARGET, "database storage ready at {url}");
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            self.retry(|| async move { sqlx::query(statement).execute(&self.pool).await })
                .await?;
        }
        Ok(())
    }

    async fn retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = sqlx::Result<T>>,
    {
        Ok(self.retrier.exec(op, is_transient_sqlx).await?)
    }

    /// Apply `metrics` in one transaction tagged with `batch_id`.
    ///
    /// If the id was already recorded, an earlier attempt committed and this
    /// call changes nothing. Any failing row, including a counter overflow,
    /// drops the transaction uncommitted.
    async fn apply_batch(&self, batch_id: &str, metrics: &[Metric]) -> Result<usize> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        let recorded = sqlx::query(
            "INSERT OR IGNORE INTO applied_batches (batch_id, applied_at) VALUES (?, ?)",
        )
        .bind(batch_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if recorded.rows_affected() == 0 {
            tx.rollback().await?;
            log::debug!(target: LOG_TARGET, "batch {batch_id} already applied");
            return Ok(metrics.len());
        }

        for metric in metrics {
            match metric.value {
                MetricValue::Gauge(v) => {
                    upsert_gauge(&mut tx, &metric.id, v).await?;
                }
                MetricValue::Counter(d) => {
                    upsert_counter(&mut tx, &metric.id, d)
                        .await?
                        .ok_or_else(|| MetrixError::counter_overflow(&metric.id, d))?;
                }
            }
        }

        sqlx::query("DELETE FROM applied_batches WHERE applied_at < ?")
            .bind(now - BATCH_ID_RETENTION_SECS)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(metrics.len())
    }
}

async fn upsert_gauge(conn: &mut SqliteConnection, id: &str, value: f64) -> sqlx::Result<f64> {
    sqlx::query_scalar::<_, f64>(UPSERT_GAUGE)
        .bind(id)
        .bind(MetricKind::Gauge.as_str())
        .bind(value)
        .fetch_one(&mut *conn)
        .await
}

/// New total, or `None` when adding `delta` would overflow.
async fn upsert_counter(
    conn: &mut SqliteConnection,
    id: &str,
    delta: i64,
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar::<_, i64>(UPSERT_COUNTER)
        .bind(id)
        .bind(MetricKind::Counter.as_str())
        .bind(delta)
        .fetch_optional(&mut *conn)
        .await
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl MetricStorage for DatabaseStorage {
    async fn update_gauge(&self, id: &str, value: f64) -> Result<f64> {
        validate_id(id)?;
        self.retry(|| async move {
            let mut conn = self.pool.acquire().await?;
            upsert_gauge(&mut conn, id, value).await
        })
        .await
    }

    async fn update_counter(&self, id: &str, delta: i64) -> Result<i64> {
        validate_id(id)?;
        self.retry(|| async move {
            let mut conn = self.pool.acquire().await?;
            upsert_counter(&mut conn, id, delta).await
        })
        .await?
        .ok_or_else(|| MetrixError::counter_overflow(id, delta))
    }

    async fn update_batch(&self, batch: &[MetricPayload]) -> Result<usize> {
        let metrics = accept_valid(batch, LOG_TARGET);
        if metrics.is_empty() {
            return Ok(0);
        }
        let batch_id = Uuid::new_v4().to_string();
        let batch_id = batch_id.as_str();
        let metrics = metrics.as_slice();
        self.retrier
            .exec(
                || self.apply_batch(batch_id, metrics),
                MetrixError::is_transient,
            )
            .await
    }

    async fn get_gauge(&self, id: &str) -> Result<f64> {
        self.retry(|| async move {
            sqlx::query_scalar::<_, f64>(
                "SELECT gauge_value FROM metrics WHERE id = ? AND kind = ?",
            )
            .bind(id)
            .bind(MetricKind::Gauge.as_str())
            .fetch_optional(&self.pool)
            .await
        })
        .await?
        .ok_or_else(|| MetrixError::not_found(id, MetricKind::Gauge))
    }

    async fn get_counter(&self, id: &str) -> Result<i64> {
        self.retry(|| async move {
            sqlx::query_scalar::<_, i64>(
                "SELECT counter_value FROM metrics WHERE id = ? AND kind = ?",
            )
            .bind(id)
            .bind(MetricKind::Counter.as_str())
            .fetch_optional(&self.pool)
            .await
        })
        .await?
        .ok_or_else(|| MetrixError::not_found(id, MetricKind::Counter))
    }

    async fn list_all(&self) -> Result<Vec<Metric>> {
        let rows = self
            .retry(|| async move {
                sqlx::query(
                    "SELECT id, kind, gauge_value, counter_value FROM metrics ORDER BY kind DESC, id",
                )
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        rows.iter()
            .map(|row| -> Result<Metric> {
                let id: String = row.try_get("id")?;
                let kind: String = row.try_get("kind")?;
                Ok(match kind.parse::<MetricKind>()? {
                    MetricKind::Gauge => Metric::gauge(id, row.try_get("gauge_value")?),
                    MetricKind::Counter => Metric::counter(id, row.try_get("counter_value")?),
                })
            })
            .collect()
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        self.retry(|| async move { sqlx::query("SELECT 1").execute(&self.pool).await })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
