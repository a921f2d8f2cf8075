use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::state::Phase;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook verification failed: {0}")]
    WebhookVerification(String),

    #[error("GitHub API error: {0}")]
    GitHubApi(String),

    #[error("GitHub unavailable: {0}")]
    GitHubUnavailable(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Git network error: {0}")]
    GitNetwork(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("LLM request rejected: {0}")]
    LlmRejected(String),

    #[error("LLM transient error: {0}")]
    LlmTransient(String),

    #[error("LLM request timed out after {0}s")]
    LlmTimeout(u64),

    #[error("LLM session error: {0}")]
    Session(String),

    #[error("Could not map LLM response to {artifact}: {detail}")]
    Content { artifact: String, detail: String },

    #[error("Test output could not be classified: {0}")]
    UnclassifiedOutput(String),

    #[error("Test runner error: {0}")]
    TestRunner(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Run {run_id} is leased by {holder}")]
    LeaseHeld { run_id: String, holder: String },

    #[error("Concurrent update to run {0}")]
    Conflict(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<AppError>,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How an error should be handled at the orchestration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried automatically up to policy limits.
    Transient,
    /// Surfaced immediately.
    Permanent,
    /// Needs a human: the run is failed rather than continued on bad output.
    Content,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Content => "content",
        };
        f.write_str(s)
    }
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::LlmTransient(_)
            | AppError::LlmTimeout(_)
            | AppError::GitHubUnavailable(_)
            | AppError::GitNetwork(_)
            | AppError::LeaseHeld { .. }
            | AppError::Conflict(_)
            | AppError::Io(_) => ErrorClass::Transient,
            AppError::Http(e) if e.is_timeout() || e.is_connect() => ErrorClass::Transient,
            AppError::Content { .. } | AppError::UnclassifiedOutput(_) => ErrorClass::Content,
            AppError::Phase { source, .. } => source.class(),
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn content(artifact: &str, detail: impl Into<String>) -> Self {
        AppError::Content {
            artifact: artifact.to_string(),
            detail: detail.into(),
        }
    }

    /// Attach the phase an error originated in. Already-tagged errors are kept as is.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            AppError::Phase { .. } | AppError::Cancelled => self,
            other => AppError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with any phase wrapper removed.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Phase { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<octocrab::Error> for AppError {
    fn from(e: octocrab::Error) -> Self {
        match &e {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code;
                let detail = format!("{status}: {}", source.message);
                let rate_limited = status.as_u16() == 429
                    || (status.as_u16() == 403
                        && source.message.to_ascii_lowercase().contains("rate limit"));
                if status.is_server_error() || rate_limited {
                    AppError::GitHubUnavailable(detail)
                } else {
                    AppError::GitHubApi(detail)
                }
            }
            octocrab::Error::Hyper { source, .. } => AppError::GitHubUnavailable(source.to_string()),
            octocrab::Error::Service { source, .. } => {
                AppError::GitHubUnavailable(source.to_string())
            }
            _ => AppError::GitHubApi(e.to_string()),
        }
    }
}

impl From<git2::Error> for AppError {
    fn from(e: git2::Error) -> Self {
        match e.class() {
            git2::ErrorClass::Net | git2::ErrorClass::Ssh | git2::ErrorClass::Http => {
                AppError::GitNetwork(e.message().to_string())
            }
            _ => AppError::Git(e.message().to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
