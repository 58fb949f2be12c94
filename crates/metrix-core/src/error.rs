//! Error types for metrix.
//!
//! Every fallible operation in the workspace returns [`MetrixError`]; callers
//! add operation context before logging.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::MetricKind;

/// Result type alias for metrix operations.
pub type Result<T> = std::result::Result<T, MetrixError>;

/// Main error type for metrix.
#[derive(Error, Debug)]
pub enum MetrixError {
    // Store errors
    #[error("metric not found: {kind} {id}")]
    NotFound { id: String, kind: MetricKind },

    #[error("unknown metric type: {0:?}")]
    InvalidKind(String),

    #[error("invalid metric {id:?}: {reason}")]
    InvalidMetric { id: String, reason: String },

    #[error("transient backend failure: {0}")]
    TransientBackend(String),

    #[error("backend failure: {0}")]
    PermanentBackend(String),

    #[error("snapshot file {path:?}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Delivery errors
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("collector rejected report with status {status}: {body}")]
    Rejected { status: u16, body: String },

    // Envelope errors
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("envelope codec failure: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MetrixError {
    /// Whether the failure is worth another attempt on the retry ladder.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend(_) | Self::Transport(_))
    }

    /// Whether the failure means "no prior value" for a read.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn not_found(id: &str, kind: MetricKind) -> Self {
        Self::NotFound {
            id: id.to_string(),
            kind,
        }
    }

    pub(crate) fn counter_overflow(id: &str, delta: i64) -> Self {
        Self::InvalidMetric {
            id: id.to_string(),
            reason: format!("adding {delta} overflows the counter total"),
        }
    }
}

impl From<sqlx::Error> for MetrixError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            Self::TransientBackend(err.to_string())
        } else {
            Self::PermanentBackend(err.to_string())
        }
    }
}

/// Connection-class failures only. Constraint violations and malformed
/// statements are never retried.
pub(crate) fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}
