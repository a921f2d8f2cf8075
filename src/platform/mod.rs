pub mod github;
pub mod tracker;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;
use types::*;

pub use tracker::GitHubTracker;

#[async_trait]
pub trait Platform: Send + Sync {
    /// Get an installation-scoped access token.
    async fn get_access_token(&self, installation_id: u64) -> Result<String>;

    async fn get_repository(&self, installation_id: u64, repo_full_name: &str) -> Result<RepoInfo>;

    /// Fetch a full issue with comments.
    async fn get_issue(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        issue_number: u64,
    ) -> Result<Issue>;

    /// Post a comment on an issue or PR.
    async fn post_comment(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<()>;

    /// The open pull request whose head is `head_branch`, if any.
    async fn find_open_pull_request(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        head_branch: &str,
    ) -> Result<Option<PullRequestRef>>;

    async fn create_pull_request(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        draft: PullRequestDraft<'_>,
    ) -> Result<PullRequestRef>;

    /// Replace the title and body of an existing pull request.
    async fn update_pull_request(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef>;
}
