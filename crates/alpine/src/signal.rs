//! Signal & Cancellation (Section 4.8): a single root context governs the
//! process. The first interrupt or termination signal cancels it once;
//! further signals are ignored.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Install a signal handler that cancels `root` exactly once, then returns
/// immediately. Call this once from the entry point and hold onto `root`.
pub fn install(root: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received interrupt, cancelling");
        root.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
