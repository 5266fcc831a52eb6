//! Shutdown triggers shared by the transports.

use tokio::sync::watch;
use tracing::info;

/// Wait for SIGINT, SIGTERM or the service's shutdown flag.
///
/// A signal whose handler cannot be installed is logged and then ignored; the
/// remaining sources still end the wait.
pub(crate) async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let requested = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = requested => {
            info!("Shutdown requested by the service...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_when_the_service_flag_is_set() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(shutdown_signal(rx));

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("shutdown signal should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn resolves_immediately_when_already_set() {
        let (_tx, rx) = watch::channel(true);
        tokio::time::timeout(Duration::from_secs(5), shutdown_signal(rx))
            .await
            .expect("shutdown signal should resolve");
    }
}
