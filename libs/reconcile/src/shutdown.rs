//! Shutdown signal helpers.
//!
//! Shutdown is a `watch::Receiver<bool>`; `true` means stop. A dropped sender
//! is treated as a stop signal as well.

use std::time::Duration;

use tokio::sync::watch;

/// Resolves once shutdown is signaled or the sender is dropped.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleep for `delay`. Returns true if shutdown was signaled first.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = wait_for_shutdown(shutdown) => true,
    }
}
