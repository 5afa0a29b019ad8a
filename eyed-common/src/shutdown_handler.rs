use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cooperative shutdown shared by every thread and task in a service.
///
/// Signal handlers only cancel the token; all teardown work belongs to the
/// main threads. The pending-request gauge lets the main task wait for
/// handlers that were already in flight when the signal arrived.
#[derive(Clone, Debug)]
pub struct ShutdownHandler {
    ct: CancellationToken,
    n_requests_pending_completion: Arc<AtomicUsize>,
    pending_requests_timeout: Duration,
}

impl ShutdownHandler {
    pub fn new(pending_requests_timeout_secs: u64) -> Self {
        Self {
            ct: CancellationToken::new(),
            n_requests_pending_completion: Arc::new(AtomicUsize::new(0)),
            pending_requests_timeout: Duration::from_secs(pending_requests_timeout_secs),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ct.is_cancelled()
    }

    pub fn trigger_manual_shutdown(&self) {
        self.ct.cancel()
    }

    pub async fn wait_for_shutdown(&self) {
        self.ct.cancelled().await
    }

    pub async fn register_signal_handler(&self) {
        let ct = self.ct.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            ct.cancel();
            tracing::info!("Shutdown signal received.");
        });
    }

    pub fn increment_requests_pending_completion(&self) {
        self.n_requests_pending_completion
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_requests_pending_completion(&self) {
        self.n_requests_pending_completion
            .fetch_sub(1, Ordering::SeqCst);
    }

    pub async fn wait_for_pending_requests_completion(&self) {
        let check_interval = Duration::from_millis(100);
        let start = Instant::now();

        while self.n_requests_pending_completion.load(Ordering::SeqCst) > 0 {
            if start.elapsed() >= self.pending_requests_timeout {
                tracing::error!("Timed out waiting for pending requests to complete.");
                return;
            }

            tokio::time::sleep(check_interval).await;
        }

        tracing::info!("Pending requests count reached zero.");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("Ctrl+C received.");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
        tracing::info!("SIGTERM received.");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_handler() {
        let mut handler = ShutdownHandler::new(1);
        handler.pending_requests_timeout /= 10; // Shorten timeout for test

        // Start work.
        assert!(!handler.is_shutting_down());
        handler.increment_requests_pending_completion();

        // Initiate a shutdown.
        handler.trigger_manual_shutdown();
        assert!(handler.is_shutting_down());

        // If requests do not complete, return anyway after timeout.
        handler.wait_for_pending_requests_completion().await;

        // Complete the request.
        handler.decrement_requests_pending_completion();

        // Should return quickly since no requests are pending
        let quick = timeout(
            Duration::from_millis(10),
            handler.wait_for_pending_requests_completion(),
        );
        assert!(quick.await.is_ok());
    }
}
