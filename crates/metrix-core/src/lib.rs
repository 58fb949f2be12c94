//! # metrix-core
//!
//! **Shared building blocks for a push-based metrics pipeline.**
//!
//! An agent samples runtime and system gauges and pushes them to a
//! collector, which aggregates them into a durable store. This crate holds
//! everything both sides agree on:
//!
//! - the metric model: `(id, kind)` identities, gauge and counter values,
//!   and the JSON [`MetricPayload`] that travels on the wire
//! - [`MetricStorage`] with an in-memory/snapshot-file backend and a SQLite
//!   backend, wrapped by the [`Repository`] sync policy
//! - the transport [`Envelope`]: gzip, optional AES-GCM, optional
//!   HMAC-SHA256 signing
//! - the [`Retrier`] backoff ladder and the [`Semaphore`] concurrency gate
//!
//! ## Quick Start
//!
//! ```no_run
//! use metrix_core::{MemoryStorage, MetricStorage};
//!
//! # async fn demo() -> metrix_core::Result<()> {
//! let store = MemoryStorage::new();
//! store.update_counter("PollCount", 3).await?;
//! store.update_gauge("Alloc", 1024.0).await?;
//! assert_eq!(store.get_counter("PollCount").await?, 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Sampler → Snapshot → Envelope (seal) → HTTP → Envelope (unseal) →
//! Repository → Storage

pub mod config;
pub mod envelope;
pub mod error;
pub mod model;
pub mod repository;
pub mod retry;
pub mod semaphore;
pub mod storage;

pub use config::{AgentConfig, EnvelopeConfig, ServerConfig, StorageConfig};
pub use envelope::{
    Cipher, Envelope, GZIP_ENCODING, JSON_CONTENT_TYPE, SIGNATURE_HEADER, SealedBatch,
};
pub use error::{MetrixError, Result};
pub use model::{Metric, MetricKind, MetricPayload, MetricValue, accept_valid, validate_id};
pub use repository::Repository;
pub use retry::{DEFAULT_LADDER, Retrier};
pub use semaphore::{Semaphore, SemaphoreGuard};
pub use storage::{DatabaseStorage, MemoryStorage, MetricStorage, open_storage};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
