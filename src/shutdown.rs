use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use crate::server::AppState;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(200);

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Cancel in-flight runs and wait for them to stop.
///
/// Cancelled runs keep their last persisted state and are resumed by the
/// startup scan on the next start.
pub async fn graceful_shutdown(state: &Arc<AppState>) {
    tracing::info!("Starting graceful shutdown...");

    let cancelled = state.runs.cancel_all().await;
    if cancelled == 0 {
        tracing::info!("No in-flight runs");
        return;
    }
    tracing::info!(count = cancelled, "Cancelled in-flight runs");

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        let remaining = state.runs.active().await;
        if remaining.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            for (key, run_id) in remaining {
                tracing::warn!(work_item = %key, run_id = %run_id, "Run did not stop before shutdown");
            }
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }

    tracing::info!("Graceful shutdown complete");
}
