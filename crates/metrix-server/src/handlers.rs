//! Route handlers. Every POST body has already been unsealed by the
//! envelope middleware when it reaches these functions.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::de::DeserializeOwned;

use metrix_core::{Metric, MetricKind, MetricPayload, MetrixError};

use crate::AppState;
use crate::error::ApiError;

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError(MetrixError::Codec(format!("request body: {e}"))))
}

fn invalid_value(id: &str, raw: &str, kind: MetricKind) -> ApiError {
    ApiError(MetrixError::InvalidMetric {
        id: id.to_string(),
        reason: format!("{raw:?} is not a valid {kind} value"),
    })
}

/// `POST /update/{kind}/{id}/{value}`
pub(crate) async fn update_plain(
    State(state): State<Arc<AppState>>,
    Path((kind, id, raw)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let kind: MetricKind = kind.parse()?;
    let metric = match kind {
        MetricKind::Gauge => Metric::gauge(
            &id,
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| invalid_value(&id, &raw, kind))?,
        ),
        MetricKind::Counter => Metric::counter(
            &id,
            raw.parse::<i64>()
                .map_err(|_| invalid_value(&id, &raw, kind))?,
        ),
    };
    state.repository.update(&metric).await?;
    Ok(StatusCode::OK)
}

/// `GET /value/{kind}/{id}`
pub(crate) async fn value_plain(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let kind: MetricKind = kind.parse()?;
    Ok(match kind {
        MetricKind::Gauge => state.repository.get_gauge(&id).await?.to_string(),
        MetricKind::Counter => state.repository.get_counter(&id).await?.to_string(),
    })
}

/// `POST /update` with a single JSON payload; returns the stored record.
pub(crate) async fn update_json(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<MetricPayload>, ApiError> {
    let payload: MetricPayload = parse_json(&body)?;
    let metric = Metric::try_from(&payload)?;
    let stored = state.repository.update(&metric).await?;
    Ok(Json(MetricPayload::from(&stored)))
}

/// `POST /value` with `{id, type}`; returns the stored record.
pub(crate) async fn value_json(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<MetricPayload>, ApiError> {
    let payload: MetricPayload = parse_json(&body)?;
    let kind: MetricKind = payload.kind.parse()?;
    let stored = state.repository.get(&payload.id, kind).await?;
    Ok(Json(MetricPayload::from(&stored)))
}

/// `POST /updates` with a JSON array.
pub(crate) async fn update_batch(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batch: Vec<MetricPayload> = parse_json(&body)?;
    let applied = state.repository.update_batch(&batch).await?;
    Ok(Json(serde_json::json!({
        "received": batch.len(),
        "applied": applied,
    })))
}

/// `GET /`: every stored record.
pub(crate) async fn list_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<MetricPayload>>, ApiError> {
    let metrics = state.repository.list_all().await?;
    Ok(Json(metrics.iter().map(MetricPayload::from).collect()))
}

/// `GET /ping`: backend liveness.
pub(crate) async fn ping(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiError> {
    state.repository.check_health().await?;
    Ok("OK")
}
