use crate::error::{AppError, Result};
use crate::platform::types;

/// Map octocrab Issue to our platform Issue type.
pub fn map_issue(
    issue: &octocrab::models::issues::Issue,
    comments: Vec<octocrab::models::issues::Comment>,
) -> types::Issue {
    types::Issue {
        title: issue.title.clone(),
        body: issue.body.clone().unwrap_or_default(),
        labels: issue.labels.iter().map(|l| l.name.clone()).collect(),
        comments: comments.into_iter().map(map_comment).collect(),
    }
}

fn map_comment(comment: octocrab::models::issues::Comment) -> types::Comment {
    let from_bot = is_bot(&comment.user.r#type, &comment.user.login);
    types::Comment {
        author: comment.user.login,
        body: comment.body.unwrap_or_default(),
        from_bot,
    }
}

fn is_bot(account_type: &str, login: &str) -> bool {
    account_type.eq_ignore_ascii_case("bot") || login.ends_with("[bot]")
}

pub fn map_pull_request(pr: octocrab::models::pulls::PullRequest) -> types::PullRequestRef {
    types::PullRequestRef {
        number: pr.number,
        head: pr.head.ref_field,
        url: pr.html_url.map(|u| u.to_string()),
    }
}

pub fn map_repository(
    full_name: &str,
    repo: octocrab::models::Repository,
) -> Result<types::RepoInfo> {
    let clone_url = repo
        .clone_url
        .map(|u| u.to_string())
        .ok_or_else(|| AppError::GitHubApi(format!("{full_name} has no clone URL")))?;
    Ok(types::RepoInfo {
        full_name: repo.full_name.unwrap_or_else(|| full_name.to_string()),
        clone_url,
        default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
    })
}
