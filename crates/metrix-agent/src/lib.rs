//! Metrics agent.
//!
//! Two samplers keep a [`SnapshotSource`] fresh; a [`WorkerPool`] wakes up
//! every report interval, seals the latest snapshot and posts it to the
//! collector's batch endpoint through a [`MetricsClient`].
//!
//! ```no_run
//! use metrix_agent::Agent;
//! use metrix_core::AgentConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> metrix_core::Result<()> {
//! let agent = Agent::new(AgentConfig::default())?;
//! agent.run(CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use metrix_core::{AgentConfig, Envelope, MetricPayload, Result, Retrier};

pub mod client;
pub mod probe;
pub mod source;
pub mod worker;

pub use client::MetricsClient;
pub use source::SnapshotSource;
pub use worker::{Reporter, WorkerPool};

pub const LOG_TARGET: &str = "metrix::agent";

/// Reports the current snapshot of a source.
pub struct SnapshotReporter {
    source: Arc<SnapshotSource>,
    client: MetricsClient,
}

impl SnapshotReporter {
    pub fn new(source: Arc<SnapshotSource>, client: MetricsClient) -> Self {
        Self { source, client }
    }
}

#[async_trait]
impl Reporter for SnapshotReporter {
    async fn report(&self) -> Result<()> {
        let batch: Vec<MetricPayload> = self
            .source
            .get_snapshot()
            .iter()
            .map(MetricPayload::from)
            .collect();
        self.client.send_batch(&batch).await
    }
}

/// Samplers plus delivery workers, wired from an [`AgentConfig`].
pub struct Agent {
    source: Arc<SnapshotSource>,
    pool: WorkerPool,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let envelope = Envelope::new(&config.envelope)?;
        let client = MetricsClient::new(
            &config.server_addr,
            envelope,
            Retrier::new(config.retry_ladder.clone()),
        )?;
        let source = Arc::new(SnapshotSource::new(config.poll_interval));
        let reporter = Arc::new(SnapshotReporter::new(Arc::clone(&source), client));
        let pool = WorkerPool::new(
            config.workers,
            config.report_interval,
            config.rate_limit,
            reporter,
        );
        log::info!(
            target: LOG_TARGET,
            "reporting to {} (poll {:?}, report {:?})",
            config.server_addr,
            config.poll_interval,
            config.report_interval
        );
        Ok(Self { source, pool })
    }

    pub fn source(&self) -> &Arc<SnapshotSource> {
        &self.source
    }

    /// Run until `shutdown` is cancelled and every task has stopped.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tasks = self.source.spawn(shutdown.clone());
        tasks.extend(self.pool.spawn(shutdown));
        for task in tasks {
            if let Err(e) = task.await {
                log::error!(target: LOG_TARGET, "task ended abnormally: {e}");
            }
        }
        log::info!(target: LOG_TARGET, "agent stopped");
    }
}
