//! Run scheduling: one tokio task per active work item, bounded by a
//! semaphore, each with its own cancellation token.

pub mod startup;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::server::AppState;
use crate::workflow::{RunId, StateStore, WorkItemKey};

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
}

pub struct RunQueue {
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<WorkItemKey, ActiveRun>>,
}

impl RunQueue {
    pub fn new(max_concurrent_runs: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Mark `key` active. Returns `None` if a run for it is already active.
    async fn register(&self, key: &WorkItemKey, run_id: &RunId) -> Option<CancellationToken> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(key) {
            tracing::info!(work_item = %key, run_id = %existing.run_id, "Run already active");
            return None;
        }
        let cancel = CancellationToken::new();
        active.insert(
            key.clone(),
            ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            },
        );
        Some(cancel)
    }

    async fn finish(&self, key: &WorkItemKey) {
        self.active.lock().await.remove(key);
    }

    /// Cancel the active run for `key`, if any.
    pub async fn cancel(&self, key: &WorkItemKey) -> bool {
        match self.active.lock().await.get(key) {
            Some(run) => {
                tracing::info!(work_item = %key, run_id = %run.run_id, "Cancelling run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active run. Returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        let active = self.active.lock().await;
        for run in active.values() {
            run.cancel.cancel();
        }
        active.len()
    }

    pub async fn active(&self) -> Vec<(WorkItemKey, RunId)> {
        self.active
            .lock()
            .await
            .iter()
            .map(|(k, r)| (k.clone(), r.run_id.clone()))
            .collect()
    }
}

/// Find the persisted run for `key` that has not finished yet.
pub async fn find_open_run(store: &dyn StateStore, key: &WorkItemKey) -> Result<Option<RunId>> {
    for run_id in store.list().await? {
        if let Some(record) = store.load(&run_id).await? {
            if &record.state.work_item == key && !record.state.is_terminal() {
                return Ok(Some(run_id));
            }
        }
    }
    Ok(None)
}

/// Start (or resume) the run for `key` in the background.
pub async fn start_run(state: &Arc<AppState>, key: WorkItemKey) -> Result<Option<RunId>> {
    let run_id = match find_open_run(state.store.as_ref(), &key).await? {
        Some(run_id) => run_id,
        None => RunId::generate(),
    };
    Ok(spawn_run(state, run_id.clone(), key).await.then_some(run_id))
}

/// Spawn a task driving `run_id`. Returns false if `key` already has one.
pub async fn spawn_run(state: &Arc<AppState>, run_id: RunId, key: WorkItemKey) -> bool {
    let Some(cancel) = state.runs.register(&key, &run_id).await else {
        return false;
    };

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = state.runs.permits.clone().acquire_owned() => permit.ok(),
        };

        if let Some(_permit) = permit {
            match task::execute_run(&state, &run_id, &key, cancel).await {
                Ok(final_state) => tracing::info!(
                    run_id = %run_id,
                    work_item = %key,
                    phase = %final_state.phase,
                    "Run task completed"
                ),
                Err(e) => tracing::error!(
                    run_id = %run_id,
                    work_item = %key,
                    error = %e,
                    "Run task stopped"
                ),
            }
        } else {
            tracing::info!(run_id = %run_id, work_item = %key, "Run cancelled before it started");
        }
        state.runs.finish(&key).await;
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{MemoryStateStore, Phase, StoredRun, WorkflowState};

    fn key(number: u64) -> WorkItemKey {
        WorkItemKey {
            installation_id: 1,
            repo: "acme/widgets".to_string(),
            number,
        }
    }

    #[tokio::test]
    async fn test_register_deduplicates_and_cancels() {
        let queue = RunQueue::new(2);
        let run_id = RunId::generate();

        let token = queue.register(&key(1), &run_id).await.unwrap();
        assert!(queue.register(&key(1), &RunId::generate()).await.is_none());
        assert_eq!(queue.active().await, vec![(key(1), run_id)]);

        assert!(queue.cancel(&key(1)).await);
        assert!(token.is_cancelled());
        assert!(!queue.cancel(&key(2)).await);

        queue.finish(&key(1)).await;
        assert!(queue.active().await.is_empty());
        assert!(queue.register(&key(1), &RunId::generate()).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let queue = RunQueue::new(1);
        let a = queue.register(&key(1), &RunId::generate()).await.unwrap();
        let b = queue.register(&key(2), &RunId::generate()).await.unwrap();

        assert_eq!(queue.cancel_all().await, 2);
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[tokio::test]
    async fn test_find_open_run_skips_finished_and_foreign_runs() {
        let store = MemoryStateStore::new();
        let mut done = WorkflowState::new(RunId::parse("00000001").unwrap(), key(1));
        done.phase = Phase::Done;
        let other = WorkflowState::new(RunId::parse("00000002").unwrap(), key(2));
        let open = WorkflowState::new(RunId::parse("00000003").unwrap(), key(1));
        for state in [done, other, open] {
            let id = state.run_id.clone();
            store
                .compare_and_swap(&id, None, StoredRun::new(state))
                .await
                .unwrap();
        }

        let found = find_open_run(&store, &key(1)).await.unwrap();
        assert_eq!(found, Some(RunId::parse("00000003").unwrap()));
        assert_eq!(find_open_run(&store, &key(3)).await.unwrap(), None);
    }
}
