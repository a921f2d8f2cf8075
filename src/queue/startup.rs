use std::sync::Arc;

use crate::queue::spawn_run;
use crate::server::AppState;

/// Resume every persisted run that has not reached a terminal phase.
///
/// This allows the service to pick up where it left off after a restart.
pub async fn resume_pending_runs(state: &Arc<AppState>) {
    tracing::info!("Scanning state store for unfinished runs...");

    let run_ids = match state.store.list().await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list runs on startup");
            return;
        }
    };

    let mut resumed = 0;
    for run_id in run_ids {
        let record = match state.store.load(&run_id).await {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to load run");
                continue;
            }
        };
        if record.state.is_terminal() {
            continue;
        }

        tracing::info!(
            run_id = %run_id,
            work_item = %record.state.work_item,
            phase = %record.state.phase,
            "Resuming unfinished run"
        );
        if spawn_run(state, run_id, record.state.work_item).await {
            resumed += 1;
        }
    }

    tracing::info!(resumed, "Startup scan complete");
}
