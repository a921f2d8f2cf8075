use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::workflow::state::{RunId, WorkflowState};

/// Exclusive, time-bounded claim on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A persisted run together with its store version and lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub version: u64,
    pub state: WorkflowState,
    pub lease: Option<Lease>,
}

impl StoredRun {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            version: 0,
            state,
            lease: None,
        }
    }
}

/// Versioned run storage.
///
/// Every write is a compare-and-swap against the version the writer read;
/// `expected = None` means the record must not exist yet. On success the
/// new version is returned, otherwise [`AppError::Conflict`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, run_id: &RunId) -> Result<Option<StoredRun>>;

    async fn compare_and_swap(
        &self,
        run_id: &RunId,
        expected: Option<u64>,
        record: StoredRun,
    ) -> Result<u64>;

    async fn list(&self) -> Result<Vec<RunId>>;
}

fn next_version(run_id: &RunId, expected: Option<u64>, current: Option<u64>) -> Result<u64> {
    if expected != current {
        return Err(AppError::Conflict(format!(
            "{run_id}: expected version {expected:?}, found {current:?}"
        )));
    }
    Ok(current.map_or(1, |v| v + 1))
}

/// In-process store, used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryStateStore {
    runs: Mutex<HashMap<RunId, StoredRun>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, run_id: &RunId) -> Result<Option<StoredRun>> {
        Ok(self.runs.lock().await.get(run_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        run_id: &RunId,
        expected: Option<u64>,
        mut record: StoredRun,
    ) -> Result<u64> {
        let mut runs = self.runs.lock().await;
        let version = next_version(run_id, expected, runs.get(run_id).map(|r| r.version))?;
        record.version = version;
        runs.insert(run_id.clone(), record);
        Ok(version)
    }

    async fn list(&self) -> Result<Vec<RunId>> {
        let mut ids: Vec<RunId> = self.runs.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One JSON file per run under `dir`.
///
/// Writers take an exclusive `fs2` lock on `{run_id}.lock`, so the version
/// check and the write are atomic across processes. Records are written to
/// a temporary file and renamed into place.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn record_path(dir: &Path, run_id: &RunId) -> PathBuf {
        dir.join(format!("{run_id}.json"))
    }

    fn read_record(path: &Path) -> Result<Option<StoredRun>> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, run_id: &RunId) -> Result<Option<StoredRun>> {
        let path = Self::record_path(&self.dir, run_id);
        tokio::task::spawn_blocking(move || Self::read_record(&path))
            .await
            .map_err(|e| AppError::Store(format!("Load task panicked: {e}")))?
    }

    async fn compare_and_swap(
        &self,
        run_id: &RunId,
        expected: Option<u64>,
        mut record: StoredRun,
    ) -> Result<u64> {
        let dir = self.dir.clone();
        let run_id = run_id.clone();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            fs::create_dir_all(&dir)?;
            let lock_file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.join(format!("{run_id}.lock")))?;
            lock_file.lock_exclusive()?;

            let path = Self::record_path(&dir, &run_id);
            let current = Self::read_record(&path)?.map(|r| r.version);
            let version = next_version(&run_id, expected, current)?;
            record.version = version;

            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
            fs::rename(&tmp, &path)?;

            // Released on drop as well; explicit so the order is obvious.
            FileExt::unlock(&lock_file)?;
            Ok(version)
        })
        .await
        .map_err(|e| AppError::Store(format!("Write task panicked: {e}")))?
    }

    async fn list(&self) -> Result<Vec<RunId>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<RunId>> {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut ids = Vec::new();
            for entry in entries {
                let name = entry?.file_name();
                let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                    continue;
                };
                match RunId::parse(stem) {
                    Ok(id) => ids.push(id),
                    Err(_) => tracing::debug!(file = stem, "Skipping unrecognised state file"),
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
        .map_err(|e| AppError::Store(format!("List task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::{Phase, WorkItemKey};
    use std::sync::Arc;

    fn record(id: &str) -> (RunId, StoredRun) {
        let run_id = RunId::parse(id).unwrap();
        let state = WorkflowState::new(
            run_id.clone(),
            WorkItemKey {
                installation_id: 7,
                repo: "acme/widgets".to_string(),
                number: 3,
            },
        );
        (run_id, StoredRun::new(state))
    }

    async fn exercise_cas(store: &dyn StateStore) {
        let (id, rec) = record("00000001");

        assert!(store.load(&id).await.unwrap().is_none());
        assert_eq!(store.compare_and_swap(&id, None, rec.clone()).await.unwrap(), 1);

        // Creating twice conflicts.
        let err = store.compare_and_swap(&id, None, rec.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let mut loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        loaded.state.transition(Phase::Build).unwrap();
        assert_eq!(
            store.compare_and_swap(&id, Some(1), loaded.clone()).await.unwrap(),
            2
        );

        // A stale writer is rejected.
        let err = store.compare_and_swap(&id, Some(1), loaded).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let current = store.load(&id).await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.state.phase, Phase::Build);
    }

    #[tokio::test]
    async fn test_memory_store_cas() {
        exercise_cas(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_cas() {
        let tmp = tempfile::tempdir().unwrap();
        exercise_cas(&FileStateStore::new(tmp.path())).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen_and_lists() {
        let tmp = tempfile::tempdir().unwrap();
        let (a, rec_a) = record("0000000a");
        let (b, rec_b) = record("0000000b");
        {
            let store = FileStateStore::new(tmp.path());
            store.compare_and_swap(&b, None, rec_b).await.unwrap();
            store.compare_and_swap(&a, None, rec_a).await.unwrap();
        }
        std::fs::write(tmp.path().join("notes.json"), "{}").unwrap();

        let store = FileStateStore::new(tmp.path());
        assert_eq!(store.list().await.unwrap(), vec![a.clone(), b]);
        assert_eq!(store.load(&a).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_list_of_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(&tmp.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_have_one_winner() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(tmp.path()));
        let (id, rec) = record("000000ff");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                let rec = rec.clone();
                tokio::spawn(async move { store.compare_and_swap(&id, None, rec).await })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
