use async_trait::async_trait;
use octocrab::Octocrab;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::GitHubConfig;
use crate::error::{AppError, Result};
use crate::platform::types::*;
use crate::platform::Platform;

use super::auth::generate_app_jwt;
use super::mapper;

type TokenCache = HashMap<u64, (String, chrono::DateTime<chrono::Utc>)>;

pub struct GitHubPlatform {
    config: GitHubConfig,
    /// installation_id -> (token, expiry)
    token_cache: Arc<RwLock<TokenCache>>,
}

impl GitHubPlatform {
    pub async fn new(config: &GitHubConfig) -> Result<Self> {
        if !config.private_key_path.exists() {
            return Err(AppError::Config(format!(
                "GitHub App private key not found at: {}",
                config.private_key_path.display()
            )));
        }

        Ok(Self {
            config: config.clone(),
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Get an octocrab instance authenticated as an installation.
    async fn installation_client(&self, installation_id: u64) -> Result<Octocrab> {
        let token = self.get_access_token(installation_id).await?;
        Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| AppError::GitHubApi(format!("Failed to build octocrab client: {e}")))
    }

    fn parse_repo(repo_full_name: &str) -> Result<(&str, &str)> {
        match repo_full_name.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => Ok((owner, repo)),
            _ => Err(AppError::GitHubApi(format!(
                "Invalid repo name: {repo_full_name}"
            ))),
        }
    }
}

#[async_trait]
impl Platform for GitHubPlatform {
    async fn get_access_token(&self, installation_id: u64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expiry)) = cache.get(&installation_id) {
                if *expiry > chrono::Utc::now() + chrono::Duration::minutes(5) {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = generate_app_jwt(self.config.app_id, &self.config.private_key_path)?;

        let client = Octocrab::builder()
            .personal_token(jwt)
            .build()
            .map_err(|e| AppError::GitHubApi(format!("Failed to build JWT client: {e}")))?;

        let url = format!("/app/installations/{installation_id}/access_tokens");
        let response: serde_json::Value = client
            .post(&url, None::<&()>)
            .await
            .map_err(|e| {
                tracing::warn!(installation_id, error = %e, "Failed to create installation token");
                AppError::from(e)
            })?;

        let token = response["token"]
            .as_str()
            .ok_or_else(|| AppError::GitHubApi("No token in response".to_string()))?
            .to_string();

        let expires_at = response["expires_at"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|| chrono::Utc::now() + chrono::Duration::hours(1));

        tracing::debug!(installation_id, %expires_at, "Minted installation token");
        let mut cache = self.token_cache.write().await;
        cache.insert(installation_id, (token.clone(), expires_at));

        Ok(token)
    }

    async fn get_repository(&self, installation_id: u64, repo_full_name: &str) -> Result<RepoInfo> {
        let client = self.installation_client(installation_id).await?;
        let (owner, repo) = Self::parse_repo(repo_full_name)?;

        let repository = client.repos(owner, repo).get().await?;
        mapper::map_repository(repo_full_name, repository)
    }

    async fn get_issue(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        issue_number: u64,
    ) -> Result<Issue> {
        let client = self.installation_client(installation_id).await?;
        let (owner, repo) = Self::parse_repo(repo_full_name)?;

        let issue = client.issues(owner, repo).get(issue_number).await?;

        let comments_page = client
            .issues(owner, repo)
            .list_comments(issue_number)
            .per_page(100)
            .send()
            .await?;

        Ok(mapper::map_issue(&issue, comments_page.items))
    }

    async fn post_comment(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<()> {
        let client = self.installation_client(installation_id).await?;
        let (owner, repo) = Self::parse_repo(repo_full_name)?;

        client
            .issues(owner, repo)
            .create_comment(issue_number, body)
            .await?;

        Ok(())
    }

    async fn find_open_pull_request(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        head_branch: &str,
    ) -> Result<Option<PullRequestRef>> {
        let client = self.installation_client(installation_id).await?;
        let (owner, repo) = Self::parse_repo(repo_full_name)?;

        let page = client
            .pulls(owner, repo)
            .list()
            .state(octocrab::params::State::Open)
            .head(format!("{owner}:{head_branch}"))
            .per_page(1)
            .send()
            .await?;

        Ok(page.items.into_iter().next().map(mapper::map_pull_request))
    }

    async fn create_pull_request(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        draft: PullRequestDraft<'_>,
    ) -> Result<PullRequestRef> {
        let client = self.installation_client(installation_id).await?;
        let (owner, repo) = Self::parse_repo(repo_full_name)?;

        let created = client
            .pulls(owner, repo)
            .create(draft.title, draft.head, draft.base)
            .body(draft.body)
            .send()
            .await?;

        Ok(mapper::map_pull_request(created))
    }

    async fn update_pull_request(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef> {
        let client = self.installation_client(installation_id).await?;
        let (owner, repo) = Self::parse_repo(repo_full_name)?;

        let updated = client
            .pulls(owner, repo)
            .update(pr_number)
            .title(title)
            .body(body)
            .send()
            .await?;

        Ok(mapper::map_pull_request(updated))
    }
}
