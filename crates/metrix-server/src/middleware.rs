//! HTTP middleware: request logging and the transport envelope.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Response};
use axum::middleware::Next;
use tower::{Layer, Service};

use metrix_core::envelope::compress;
use metrix_core::{GZIP_ENCODING, MetrixError, SIGNATURE_HEADER};

use crate::AppState;
use crate::error::ApiError;

/// Request bodies larger than this are refused before unsealing.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

const SIGNATURE: HeaderName = HeaderName::from_static("hashsha256");

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Unseal POST bodies on the way in; compress and sign responses on the
/// way out.
pub(crate) async fn envelope(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response<Body>, ApiError> {
    let accepts_gzip =
        header(request.headers(), ACCEPT_ENCODING.as_str()).is_some_and(|v| v.contains(GZIP_ENCODING));

    let request = if request.method() == Method::POST {
        unseal_request(&state, request).await?
    } else {
        request
    };

    let response = next.run(request).await;
    seal_response(&state, response, accepts_gzip).await
}

async fn unseal_request(state: &AppState, request: Request) -> Result<Request, ApiError> {
    let (mut parts, body) = request.into_parts();
    let raw = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError(MetrixError::Codec(format!("reading body: {e}"))))?;

    let plain = state.envelope.unseal(
        &raw,
        header(&parts.headers, CONTENT_ENCODING.as_str()),
        header(&parts.headers, SIGNATURE_HEADER),
    )?;

    parts.headers.remove(CONTENT_ENCODING);
    parts.headers.remove(CONTENT_LENGTH);
    parts.headers.remove(SIGNATURE);
    Ok(Request::from_parts(parts, Body::from(plain)))
}

async fn seal_response(
    state: &AppState,
    response: Response<Body>,
    accepts_gzip: bool,
) -> Result<Response<Body>, ApiError> {
    if !accepts_gzip && !state.envelope.signs() {
        return Ok(response);
    }

    let (mut parts, body) = response.into_parts();
    let mut bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ApiError(MetrixError::Codec(format!("reading response: {e}"))))?
        .to_vec();

    if accepts_gzip && parts.status.is_success() && !bytes.is_empty() {
        bytes = compress(&bytes)?;
        parts
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static(GZIP_ENCODING));
        parts.headers.remove(CONTENT_LENGTH);
    }

    if let Some(signature) = state.envelope.sign_body(&bytes)? {
        let value = HeaderValue::from_str(&signature)
            .map_err(|e| ApiError(MetrixError::Codec(format!("signature header: {e}"))))?;
        parts.headers.insert(SIGNATURE, value);
    }

    Ok(Response::from_parts(parts, Body::from(bytes)))
}

/// Layer that logs method, path, status and duration of every request.
#[derive(Clone, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

#[derive(Clone)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S, ResBody> Service<Request<Body>> for LoggingService<S>
where
    S: Service<Request<Body>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ResBody: Send,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let start = Instant::now();
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;
            log::info!(
                target: crate::LOG_TARGET,
                "{method} {uri} -> {} in {}ms",
                response.status().as_u16(),
                start.elapsed().as_millis()
            );
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::{ServiceExt, service_fn};

    #[tokio::test]
    async fn logging_service_passes_response_through() {
        let service = LoggingLayer.layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, std::convert::Infallible>(
                Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .body(Body::empty())
                    .unwrap(),
            )
        }));
        let response = service
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
