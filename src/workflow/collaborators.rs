//! Interfaces to the systems a run drives.

use async_trait::async_trait;

use crate::error::Result;
use crate::results::Framework;
use crate::workflow::state::WorkItemKey;

/// Issue contents as seen by the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_item(&self, key: &WorkItemKey) -> Result<WorkItem>;
    async fn post_comment(&self, key: &WorkItemKey, body: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(String),
    NothingToCommit,
}

/// A working copy plus its remote.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create and check out `name` from the current head.
    async fn create_branch(&self, name: &str) -> Result<()>;

    /// Stage `paths` (workspace-relative; deletions included) and commit.
    async fn commit(&self, paths: &[String], message: &str) -> Result<CommitOutcome>;

    async fn push(&self) -> Result<()>;

    /// Returns the change request number.
    async fn open_or_update_change_request(
        &self,
        branch: &str,
        title: &str,
        description: &str,
    ) -> Result<u64>;

    /// Diff of the working branch against its base.
    async fn diff(&self) -> Result<String>;

    async fn read_file(&self, path: &str) -> Result<String>;

    /// Write `content` to `path`, or delete it when `content` is `None`.
    async fn write_file(&self, path: &str, content: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTestOutput {
    pub output: String,
    pub framework_hint: Option<Framework>,
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self) -> Result<RawTestOutput>;
}
