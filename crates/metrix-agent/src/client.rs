//! Delivery of sealed batches to the collector.

use std::time::Duration;

use metrix_core::{
    Envelope, GZIP_ENCODING, JSON_CONTENT_TYPE, MetricPayload, MetrixError, Result, Retrier,
    SIGNATURE_HEADER, SealedBatch,
};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};

pub const LOG_TARGET: &str = "metrix::agent-client";

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the collector's batch endpoint.
pub struct MetricsClient {
    http: reqwest::Client,
    url: String,
    envelope: Envelope,
    retrier: Retrier,
}

impl MetricsClient {
    /// `server_addr` is a `host:port`; a scheme prefix is kept if given.
    pub fn new(server_addr: &str, envelope: Envelope, retrier: Retrier) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MetrixError::Config(format!("http client: {e}")))?;
        let base = if server_addr.starts_with("http://") || server_addr.starts_with("https://") {
            server_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server_addr.trim_end_matches('/'))
        };
        Ok(Self {
            http,
            url: format!("{base}/updates/"),
            envelope,
            retrier,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Seal `batch` once and post it, retrying transport failures and 5xx
    /// answers on the ladder. An empty batch is not sent.
    pub async fn send_batch(&self, batch: &[MetricPayload]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let sealed = self.envelope.seal(batch)?;
        self.retrier
            .exec(|| self.post(&sealed), MetrixError::is_transient)
            .await?;
        log::debug!(target: LOG_TARGET, "delivered {} metrics to {}", batch.len(), self.url);
        Ok(())
    }

    async fn post(&self, sealed: &SealedBatch) -> Result<()> {
        let mut request = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(CONTENT_ENCODING, GZIP_ENCODING)
            .body(sealed.body.clone());
        if let Some(signature) = &sealed.signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.send().await.map_err(|e| {
            log::warn!(target: LOG_TARGET, "POST {} failed: {e}", self.url);
            MetrixError::Transport(e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            log::warn!(target: LOG_TARGET, "collector answered {status}");
            Err(MetrixError::Transport(format!("collector answered {status}: {body}")))
        } else {
            Err(MetrixError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}
