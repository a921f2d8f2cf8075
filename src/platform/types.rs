/// What a run needs to check a repository out.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
}

/// The parts of an issue a plan is written from.
#[derive(Debug, Clone)]
pub struct Issue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone)]
pub struct Comment {
    pub author: String,
    pub body: String,
    /// Posted by an app account, including this one.
    pub from_bot: bool,
}

/// A pull request opened or updated for a run branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub number: u64,
    pub head: String,
    pub url: Option<String>,
}

/// A pull request to open from a run branch.
#[derive(Debug, Clone, Copy)]
pub struct PullRequestDraft<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub head: &'a str,
    pub base: &'a str,
}
