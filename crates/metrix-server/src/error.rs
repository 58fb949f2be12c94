//! HTTP error mapping for the collector.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use metrix_core::MetrixError;

/// Error wrapper for converting store and envelope errors to HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub MetrixError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            MetrixError::NotFound { .. } => StatusCode::NOT_FOUND,
            MetrixError::InvalidKind(_)
            | MetrixError::InvalidMetric { .. }
            | MetrixError::Integrity(_)
            | MetrixError::Codec(_) => StatusCode::BAD_REQUEST,
            MetrixError::TransientBackend(_)
            | MetrixError::PermanentBackend(_)
            | MetrixError::Snapshot { .. }
            | MetrixError::Transport(_)
            | MetrixError::Rejected { .. }
            | MetrixError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!(target: crate::LOG_TARGET, "{}", self.0);
        }

        let body = serde_json::json!({
            "status": "error",
            "error": self.0.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<MetrixError> for ApiError {
    fn from(err: MetrixError) -> Self {
        ApiError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrix_core::MetricKind;

    #[test]
    fn statuses_follow_error_class() {
        let cases = [
            (
                MetrixError::NotFound {
                    id: "x".into(),
                    kind: MetricKind::Gauge,
                },
                StatusCode::NOT_FOUND,
            ),
            (
                MetrixError::InvalidKind("histogram".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                MetrixError::Integrity("mismatch".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                MetrixError::TransientBackend("busy".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
