use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::platform::types::Issue;
use crate::platform::Platform;
use crate::workflow::{IssueTracker, WorkItem, WorkItemKey};

/// GitHub issues as the workflow's issue tracker.
pub struct GitHubTracker {
    platform: Arc<dyn Platform>,
}

impl GitHubTracker {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl IssueTracker for GitHubTracker {
    async fn fetch_item(&self, key: &WorkItemKey) -> Result<WorkItem> {
        let issue = self
            .platform
            .get_issue(key.installation_id, &key.repo, key.number)
            .await?;
        Ok(work_item(issue))
    }

    async fn post_comment(&self, key: &WorkItemKey, body: &str) -> Result<()> {
        self.platform
            .post_comment(key.installation_id, &key.repo, key.number, body)
            .await
    }
}

/// Human comments are appended to the description; bot comments (ours
/// included) are dropped.
fn work_item(issue: Issue) -> WorkItem {
    let mut description = issue.body;
    let comments: Vec<String> = issue
        .comments
        .into_iter()
        .filter(|c| !c.from_bot)
        .map(|c| format!("**@{}:** {}", c.author, c.body.trim()))
        .collect();
    if !comments.is_empty() {
        description.push_str("\n\n## Comments\n");
        description.push_str(&comments.join("\n\n"));
    }

    WorkItem {
        title: issue.title,
        description,
        labels: issue.labels,
    }
}
