pub mod agent;
pub mod server;

use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!(target: "metrix", "interrupt received, shutting down");
        }
        token.cancel();
    });
}

pub fn runtime() -> metrix_core::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| metrix_core::MetrixError::Config(format!("tokio runtime: {e}")))
}
