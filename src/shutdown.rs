//! Signal handling and graceful shutdown (SPEC_FULL.md module H).
//!
//! A single `CancellationToken` is threaded through the supervisor's
//! background task and the HTTP server. First SIGINT/SIGTERM cancels it;
//! a second forces an immediate exit in case shutdown hangs.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Waits for SIGINT or SIGTERM, cancels `token`, then waits for a second
/// signal and exits immediately if one arrives before the caller's own
/// drain logic would otherwise finish.
pub async fn listen(token: CancellationToken) {
    wait_for_signal().await;
    info!("shutdown signal received, draining");
    token.cancel();

    wait_for_signal().await;
    warn!("second shutdown signal received, forcing exit");
    std::process::exit(1);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use signal::unix::{signal as unix_signal, SignalKind};

    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending().await
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
}
