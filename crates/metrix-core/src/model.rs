//! Metric identities, values and the wire/file record shape.
//!
//! A metric is identified by the pair `(id, kind)`: the same id may exist
//! independently as a gauge and as a counter.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MetrixError, Result};

/// Kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Absolute value, replaced by each write.
    Gauge,
    /// Signed delta, summed into a running total.
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetrixError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            other => Err(MetrixError::InvalidKind(other.to_string())),
        }
    }
}

/// Value carried by a metric write or held by a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
        }
    }
}

/// A typed metric: identity plus value.
///
/// For writes the value is the new gauge reading or the counter delta; for
/// reads it is the stored gauge or the counter's running total.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    pub fn gauge_value(&self) -> Option<f64> {
        match self.value {
            MetricValue::Gauge(v) => Some(v),
            MetricValue::Counter(_) => None,
        }
    }

    pub fn counter_value(&self) -> Option<i64> {
        match self.value {
            MetricValue::Counter(v) => Some(v),
            MetricValue::Gauge(_) => None,
        }
    }
}

/// Loosely typed metric record as it travels on the wire.
///
/// The kind is kept as a string so that a batch containing an unknown kind
/// can still be decoded and the offending entry skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MetricPayload {
    /// Payload addressing a metric without a value, as used by lookups.
    pub fn lookup(id: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            id: id.into(),
            kind: kind.to_string(),
            delta: None,
            value: None,
        }
    }
}

impl From<&Metric> for MetricPayload {
    fn from(metric: &Metric) -> Self {
        Self {
            id: metric.id.clone(),
            kind: metric.kind().to_string(),
            delta: metric.counter_value(),
            value: metric.gauge_value(),
        }
    }
}

impl TryFrom<&MetricPayload> for Metric {
    type Error = MetrixError;

    fn try_from(payload: &MetricPayload) -> Result<Self> {
        let kind: MetricKind = payload.kind.parse()?;
        let missing = || MetrixError::InvalidMetric {
            id: payload.id.clone(),
            reason: format!("{kind} value is missing"),
        };
        let value = match kind {
            MetricKind::Gauge => MetricValue::Gauge(payload.value.ok_or_else(missing)?),
            MetricKind::Counter => MetricValue::Counter(payload.delta.ok_or_else(missing)?),
        };
        Ok(Self {
            id: payload.id.clone(),
            value,
        })
    }
}

/// Reject an empty metric id.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(MetrixError::InvalidMetric {
            id: String::new(),
            reason: "metric id cannot be empty".to_string(),
        });
    }
    Ok(())
}

/// Convert a batch of payloads, dropping entries that fail validation.
///
/// Dropped entries are logged under `target`; the rest of the batch is kept
/// in its original order.
pub fn accept_valid(batch: &[MetricPayload], target: &str) -> Vec<Metric> {
    batch
        .iter()
        .filter_map(|payload| match Metric::try_from(payload) {
            Ok(metric) => Some(metric),
            Err(e) => {
                log::warn!(target: target, "skipping batch entry {:?}: {e}", payload.id);
                None
            }
        })
        .collect()
}
