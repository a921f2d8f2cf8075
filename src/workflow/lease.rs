use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::workflow::state::{RunId, WorkflowState};
use crate::workflow::store::{Lease, StateStore, StoredRun};

/// A run claimed by one holder for the duration of an action.
///
/// Every [`save`](LeasedRun::save) is a compare-and-swap against the version
/// this holder last wrote and renews the lease. [`renew`](LeasedRun::renew)
/// extends the lease without touching state, so a long action can keep its
/// claim. Dropping a `LeasedRun` without releasing leaves the lease to
/// expire, which is how a crashed holder is recovered from.
pub struct LeasedRun {
    store: Arc<dyn StateStore>,
    run_id: RunId,
    holder: String,
    ttl: Duration,
    tracked: Mutex<Tracked>,
}

struct Tracked {
    version: u64,
    saved: WorkflowState,
}

impl LeasedRun {
    pub async fn acquire(
        store: Arc<dyn StateStore>,
        run_id: &RunId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Self> {
        let record = store
            .load(run_id)
            .await?
            .ok_or_else(|| AppError::Store(format!("run {run_id} not found")))?;

        let now = Utc::now();
        if let Some(lease) = &record.lease {
            if lease.holder != holder {
                if lease.is_live(now) {
                    return Err(AppError::LeaseHeld {
                        run_id: run_id.to_string(),
                        holder: lease.holder.clone(),
                    });
                }
                tracing::warn!(
                    run_id = %run_id,
                    previous_holder = %lease.holder,
                    expired_at = %lease.expires_at,
                    "Taking over expired lease"
                );
            }
        }

        let claimed = StoredRun {
            version: record.version,
            state: record.state.clone(),
            lease: Some(lease_for(holder, ttl)),
        };
        let version = match store
            .compare_and_swap(run_id, Some(record.version), claimed)
            .await
        {
            Ok(version) => version,
            Err(AppError::Conflict(detail)) => {
                // Someone else moved first; report who holds it now if anyone.
                let current = store.load(run_id).await?;
                if let Some(lease) = current.and_then(|r| r.lease).filter(|l| l.holder != holder) {
                    return Err(AppError::LeaseHeld {
                        run_id: run_id.to_string(),
                        holder: lease.holder,
                    });
                }
                return Err(AppError::Conflict(detail));
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(run_id = %run_id, holder, version, "Lease acquired");
        Ok(Self {
            store,
            run_id: run_id.clone(),
            holder: holder.to_string(),
            ttl,
            tracked: Mutex::new(Tracked {
                version,
                saved: record.state,
            }),
        })
    }

    /// The state as of the last successful write.
    pub async fn state(&self) -> WorkflowState {
        self.tracked.lock().await.saved.clone()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persist `state` and renew the lease.
    pub async fn save(&self, state: &WorkflowState) -> Result<()> {
        let mut tracked = self.tracked.lock().await;
        let record = StoredRun {
            version: tracked.version,
            state: state.clone(),
            lease: Some(lease_for(&self.holder, self.ttl)),
        };
        tracked.version = self
            .store
            .compare_and_swap(&self.run_id, Some(tracked.version), record)
            .await?;
        tracked.saved = state.clone();
        Ok(())
    }

    /// Extend the lease, keeping the last saved state.
    ///
    /// A save already in flight renews the lease itself, so renewal is
    /// skipped rather than waiting behind it.
    pub async fn renew(&self) -> Result<()> {
        let Ok(mut tracked) = self.tracked.try_lock() else {
            return Ok(());
        };
        let record = StoredRun {
            version: tracked.version,
            state: tracked.saved.clone(),
            lease: Some(lease_for(&self.holder, self.ttl)),
        };
        tracked.version = self
            .store
            .compare_and_swap(&self.run_id, Some(tracked.version), record)
            .await?;
        tracing::trace!(run_id = %self.run_id, holder = %self.holder, "Lease renewed");
        Ok(())
    }

    /// Drop the lease, keeping the last saved state.
    pub async fn release(self) -> Result<()> {
        let tracked = self.tracked.into_inner();
        let record = StoredRun {
            version: tracked.version,
            state: tracked.saved,
            lease: None,
        };
        self.store
            .compare_and_swap(&self.run_id, Some(tracked.version), record)
            .await?;
        tracing::debug!(run_id = %self.run_id, holder = %self.holder, "Lease released");
        Ok(())
    }
}

fn lease_for(holder: &str, ttl: Duration) -> Lease {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
    Lease {
        holder: holder.to_string(),
        expires_at: Utc::now() + ttl,
    }
}
