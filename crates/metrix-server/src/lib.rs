//! HTTP metrics collector.
//!
//! Accepts plain-text, single JSON and batch JSON updates from agents,
//! unwraps the transport envelope (signature, encryption, gzip) and applies
//! the writes to a [`Repository`].
//!
//! | method | path                          | handler                     |
//! |--------|-------------------------------|-----------------------------|
//! | POST   | `/update/{type}/{id}/{value}` | plain-text update           |
//! | GET    | `/value/{type}/{id}`          | plain-text value            |
//! | POST   | `/update`                     | JSON update, returns record |
//! | POST   | `/value`                      | JSON lookup                 |
//! | POST   | `/updates`                    | JSON batch                  |
//! | GET    | `/`                           | JSON dump of every record   |
//! | GET    | `/ping`                       | backend liveness            |
//!
//! JSON routes also answer with a trailing slash.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use metrix_core::{Envelope, MetrixError, Repository, Result, ServerConfig};

mod error;
mod handlers;
mod middleware;

pub use error::ApiError;
pub use middleware::LoggingLayer;

pub(crate) const LOG_TARGET: &str = "metrix::server";

/// In-flight requests get this long to finish after shutdown is signalled.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared server state.
pub(crate) struct AppState {
    repository: Repository,
    envelope: Envelope,
}

/// Build the axum router.
pub fn build_router(repository: Repository, envelope: Envelope) -> Router {
    let state = Arc::new(AppState {
        repository,
        envelope,
    });

    Router::new()
        .route("/", get(handlers::list_all))
        .route("/ping", get(handlers::ping))
        .route("/update/{kind}/{id}/{value}", post(handlers::update_plain))
        .route("/value/{kind}/{id}", get(handlers::value_plain))
        .route("/update", post(handlers::update_json))
        .route("/update/", post(handlers::update_json))
        .route("/value", post(handlers::value_json))
        .route("/value/", post(handlers::value_json))
        .route("/updates", post(handlers::update_batch))
        .route("/updates/", post(handlers::update_batch))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::envelope,
        ))
        .layer(LoggingLayer)
        .with_state(state)
}

/// Run the collector until `shutdown` is cancelled.
///
/// Opens the configured store, starts the flush worker in deferred mode,
/// serves until shutdown, drains in-flight requests for at most
/// [`DRAIN_TIMEOUT`] and finally closes the repository.
pub async fn run_server(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;
    let envelope = Envelope::new(&config.envelope)?;
    let repository = Repository::open(&config).await?;
    log::info!(
        target: LOG_TARGET,
        "storage: {}, store interval {:?}",
        config.storage,
        config.store_interval
    );

    let (listener, _) = bind(&config.addr).await?;
    serve(listener, repository, envelope, shutdown).await
}

/// Serve on an already bound listener. Returns after the repository is
/// closed.
pub async fn serve(
    listener: TcpListener,
    repository: Repository,
    envelope: Envelope,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!(target: LOG_TARGET, "collector listening on http://{addr}");
    }

    let flush_stop = shutdown.child_token();
    let flush_worker = repository.spawn_flush_worker(flush_stop.clone());
    let app = build_router(repository.clone(), envelope);

    let graceful = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    let mut server = tokio::spawn(graceful);

    let outcome = tokio::select! {
        joined = &mut server => joined,
        _ = shutdown.cancelled() => {
            log::info!(target: LOG_TARGET, "shutting down, draining for up to {DRAIN_TIMEOUT:?}");
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
                Ok(joined) => joined,
                Err(_) => {
                    log::warn!(target: LOG_TARGET, "drain timed out, dropping open connections");
                    server.abort();
                    Ok(Ok(()))
                }
            }
        }
    };

    // The server may also have exited on its own.
    flush_stop.cancel();
    if let Some(worker) = flush_worker {
        let _ = worker.await;
    }

    let served = match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(MetrixError::Transport(format!("server: {e}"))),
        Err(e) => Err(MetrixError::Transport(format!("server task: {e}"))),
    };

    repository.close().await?;
    log::info!(target: LOG_TARGET, "repository closed");
    served
}

/// Bind `addr` and return the listener with its resolved local address.
pub async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| MetrixError::Config(format!("cannot listen on {addr}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| MetrixError::Config(format!("listener address: {e}")))?;
    Ok((listener, local))
}
