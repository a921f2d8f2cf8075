use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::platform::types::PullRequestDraft;
use crate::platform::Platform;
use crate::workflow::{CommitOutcome, VersionControl, WorkItemKey};
use crate::workspace::git;
use crate::workspace::manager::Workspace;

/// A git2 working copy whose change requests are GitHub pull requests.
pub struct GitVersionControl {
    platform: Arc<dyn Platform>,
    installation_id: u64,
    repo: String,
    workspace: Workspace,
}

impl GitVersionControl {
    pub fn new(platform: Arc<dyn Platform>, key: &WorkItemKey, workspace: Workspace) -> Self {
        Self {
            platform,
            installation_id: key.installation_id,
            repo: key.repo.clone(),
            workspace,
        }
    }
}

#[async_trait]
impl VersionControl for GitVersionControl {
    async fn create_branch(&self, name: &str) -> Result<()> {
        git::create_branch(&self.workspace.path, name).await
    }

    async fn commit(&self, paths: &[String], message: &str) -> Result<CommitOutcome> {
        Ok(match git::commit_paths(&self.workspace.path, paths, message).await? {
            Some(sha) => CommitOutcome::Committed(sha),
            None => CommitOutcome::NothingToCommit,
        })
    }

    async fn push(&self) -> Result<()> {
        // Installation tokens expire hourly; fetch per push.
        let token = self.platform.get_access_token(self.installation_id).await?;
        let branch = git::current_branch(&self.workspace.path).await?;
        git::push(&self.workspace.path, &branch, &token).await?;
        tracing::info!(repo = %self.repo, branch = %branch, "Pushed branch");
        Ok(())
    }

    async fn open_or_update_change_request(
        &self,
        branch: &str,
        title: &str,
        description: &str,
    ) -> Result<u64> {
        let existing = self
            .platform
            .find_open_pull_request(self.installation_id, &self.repo, branch)
            .await?;

        let pr = match existing {
            Some(pr) => {
                self.platform
                    .update_pull_request(self.installation_id, &self.repo, pr.number, title, description)
                    .await?
            }
            None => {
                self.platform
                    .create_pull_request(
                        self.installation_id,
                        &self.repo,
                        PullRequestDraft {
                            title,
                            body: description,
                            head: branch,
                            base: &self.workspace.base_branch,
                        },
                    )
                    .await?
            }
        };
        tracing::info!(
            repo = %self.repo,
            pr = pr.number,
            url = pr.url.as_deref().unwrap_or("-"),
            "Change request up to date"
        );
        Ok(pr.number)
    }

    async fn diff(&self) -> Result<String> {
        git::diff_against(&self.workspace.path, &self.workspace.base_branch).await
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.workspace.read_file(path).await
    }

    async fn write_file(&self, path: &str, content: Option<&str>) -> Result<()> {
        self.workspace.write_file(path, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::platform::types::{Issue, PullRequestRef, RepoInfo};
    use crate::workspace::git::tests::init_repo;

    struct StoredPr {
        number: u64,
        head: String,
        base: String,
        body: String,
    }

    impl StoredPr {
        fn summary(&self) -> PullRequestRef {
            PullRequestRef {
                number: self.number,
                head: self.head.clone(),
                url: None,
            }
        }
    }

    #[derive(Default)]
    struct FakePlatform {
        prs: Mutex<Vec<StoredPr>>,
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn get_access_token(&self, _installation_id: u64) -> Result<String> {
            Ok("token".to_string())
        }

        async fn get_repository(&self, _id: u64, repo: &str) -> Result<RepoInfo> {
            Ok(RepoInfo {
                full_name: repo.to_string(),
                clone_url: "https://example.com/repo.git".to_string(),
                default_branch: "main".to_string(),
            })
        }

        async fn get_issue(&self, _id: u64, _repo: &str, _number: u64) -> Result<Issue> {
            Ok(Issue {
                title: String::new(),
                body: String::new(),
                labels: vec![],
                comments: vec![],
            })
        }

        async fn post_comment(&self, _id: u64, _repo: &str, _n: u64, _body: &str) -> Result<()> {
            Ok(())
        }

        async fn find_open_pull_request(
            &self,
            _id: u64,
            _repo: &str,
            head_branch: &str,
        ) -> Result<Option<PullRequestRef>> {
            let prs = self.prs.lock().unwrap();
            Ok(prs.iter().find(|p| p.head == head_branch).map(StoredPr::summary))
        }

        async fn create_pull_request(
            &self,
            _id: u64,
            _repo: &str,
            draft: PullRequestDraft<'_>,
        ) -> Result<PullRequestRef> {
            let mut prs = self.prs.lock().unwrap();
            let created = StoredPr {
                number: 100 + prs.len() as u64,
                head: draft.head.to_string(),
                base: draft.base.to_string(),
                body: draft.body.to_string(),
            };
            let pr = created.summary();
            prs.push(created);
            Ok(pr)
        }

        async fn update_pull_request(
            &self,
            _id: u64,
            _repo: &str,
            pr_number: u64,
            _title: &str,
            body: &str,
        ) -> Result<PullRequestRef> {
            let mut prs = self.prs.lock().unwrap();
            let pr = prs.iter_mut().find(|p| p.number == pr_number).unwrap();
            pr.body = body.to_string();
            Ok(pr.summary())
        }
    }

    fn key() -> WorkItemKey {
        WorkItemKey {
            installation_id: 1,
            repo: "acme/widgets".to_string(),
            number: 4,
        }
    }

    #[tokio::test]
    async fn test_change_request_is_created_once_then_updated() {
        let tmp = tempfile::tempdir().unwrap();
        let base = init_repo(tmp.path());
        let platform = Arc::new(FakePlatform::default());
        let vcs = GitVersionControl::new(
            platform.clone(),
            &key(),
            Workspace {
                path: tmp.path().to_path_buf(),
                base_branch: base.clone(),
            },
        );

        let first = vcs
            .open_or_update_change_request("bug-4-abcd1234-x", "Fix", "v1")
            .await
            .unwrap();
        let second = vcs
            .open_or_update_change_request("bug-4-abcd1234-x", "Fix", "v2")
            .await
            .unwrap();

        assert_eq!(first, second);
        let prs = platform.prs.lock().unwrap();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].body, "v2");
        assert_eq!(prs[0].base, base);
    }

    #[tokio::test]
    async fn test_edits_commit_and_diff() {
        let tmp = tempfile::tempdir().unwrap();
        let base = init_repo(tmp.path());
        let vcs = GitVersionControl::new(
            Arc::new(FakePlatform::default()),
            &key(),
            Workspace {
                path: tmp.path().to_path_buf(),
                base_branch: base,
            },
        );

        vcs.create_branch("feature-4-abcd1234-cli").await.unwrap();
        vcs.write_file("src/cli.rs", Some("pub fn run() {}\n"))
            .await
            .unwrap();
        let outcome = vcs
            .commit(&["src/cli.rs".to_string()], "Add CLI")
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed(_)));

        let again = vcs
            .commit(&["src/cli.rs".to_string()], "Add CLI")
            .await
            .unwrap();
        assert_eq!(again, CommitOutcome::NothingToCommit);

        let diff = vcs.diff().await.unwrap();
        assert!(diff.contains("+pub fn run() {}"));
        assert_eq!(vcs.read_file("src/cli.rs").await.unwrap(), "pub fn run() {}\n");
    }
}
