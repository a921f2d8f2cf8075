use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::llm::retry::RetryPolicy;
use crate::llm::routing::ModelRoutes;
use crate::results::Framework;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct GitHubConfig {
    pub app_id: u64,
    pub private_key_path: PathBuf,
    pub webhook_secret: String,
    #[serde(default = "default_trigger_label")]
    pub trigger_label: String,
}

// Manual Debug impl to avoid leaking the webhook secret
impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("app_id", &self.app_id)
            .field("private_key_path", &self.private_key_path)
            .field("webhook_secret", &"[REDACTED]")
            .field("trigger_label", &self.trigger_label)
            .finish()
    }
}

#[derive(Deserialize, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_heavy_model")]
    pub heavy_model: String,
    #[serde(default = "default_light_model")]
    pub light_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_light_timeout")]
    pub light_timeout_secs: u64,
    #[serde(default = "default_heavy_timeout")]
    pub heavy_timeout_secs: u64,
    #[serde(default)]
    pub reuse_sessions: bool,
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

// Manual Debug impl to avoid leaking the API key
impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"[REDACTED]")
            .field("api_url", &self.api_url)
            .field("heavy_model", &self.heavy_model)
            .field("light_model", &self.light_model)
            .field("max_tokens", &self.max_tokens)
            .field("light_timeout_secs", &self.light_timeout_secs)
            .field("heavy_timeout_secs", &self.heavy_timeout_secs)
            .field("reuse_sessions", &self.reuse_sessions)
            .field("session_idle_timeout_secs", &self.session_idle_timeout_secs)
            .field("retry", &self.retry)
            .finish()
    }
}

impl LlmConfig {
    pub fn routes(&self) -> ModelRoutes {
        ModelRoutes {
            heavy: self.heavy_model.clone(),
            lightweight: self.light_model.clone(),
        }
    }

    pub fn light_timeout(&self) -> Duration {
        Duration::from_secs(self.light_timeout_secs)
    }

    pub fn heavy_timeout(&self) -> Duration {
        Duration::from_secs(self.heavy_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_dir")]
    pub base_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_workspace_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    /// Shell command that runs the project's tests inside the workspace.
    #[serde(default = "default_test_command")]
    pub test_command: String,
    /// Force a specific output grammar instead of auto-detection.
    #[serde(default)]
    pub test_framework: Option<Framework>,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_max_test_retries")]
    pub max_test_retries: u32,
    #[serde(default = "default_max_review_retries")]
    pub max_review_retries: u32,
    /// How many times `drive` re-attempts a phase after a transient error.
    #[serde(default = "default_max_advance_attempts")]
    pub max_advance_attempts: u32,
    /// Size budget for failure payloads sent back to the LLM.
    #[serde(default = "default_failure_budget_tokens")]
    pub failure_budget_tokens: usize,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Treat issue-tracker failures as phase failures instead of logging them.
    #[serde(default)]
    pub require_tracker: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            test_command: default_test_command(),
            test_framework: None,
            test_timeout_secs: default_test_timeout(),
            max_test_retries: default_max_test_retries(),
            max_review_retries: default_max_review_retries(),
            max_advance_attempts: default_max_advance_attempts(),
            failure_budget_tokens: default_failure_budget_tokens(),
            lease_ttl_secs: default_lease_ttl(),
            max_concurrent_runs: default_max_concurrent_runs(),
            require_tracker: false,
        }
    }
}

impl WorkflowConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_trigger_label() -> String {
    "hypha".to_string()
}

fn default_api_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_heavy_model() -> String {
    "claude-opus-4-20250514".to_string()
}

fn default_light_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    16384
}

fn default_light_timeout() -> u64 {
    60
}

fn default_heavy_timeout() -> u64 {
    600
}

fn default_session_idle_timeout() -> u64 {
    30 * 60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/tmp/hypha-workspaces")
}

fn default_test_command() -> String {
    "cargo test".to_string()
}

fn default_test_timeout() -> u64 {
    900
}

fn default_max_test_retries() -> u32 {
    4
}

fn default_max_review_retries() -> u32 {
    3
}

fn default_max_advance_attempts() -> u32 {
    3
}

fn default_failure_budget_tokens() -> usize {
    8_000
}

fn default_lease_ttl() -> u64 {
    30 * 60
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/tmp/hypha-state")
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            // Try default paths
            builder = builder.add_source(config::File::with_name("hypha").required(false));
        }

        // Environment variable overrides with HYPHA_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("HYPHA")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn webhook_secret(&self) -> &str {
        &self.github.webhook_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let raw = r#"{
            "github": { "app_id": 1, "private_key_path": "/k.pem", "webhook_secret": "s" },
            "llm": { "api_key": "sk-test" }
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.github.trigger_label, "hypha");
        assert_eq!(config.llm.retry.max_attempts, 3);
        assert_eq!(config.workflow.max_test_retries, 4);
        assert!(config.workflow.test_framework.is_none());
        assert!(!config.llm.reuse_sessions);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let raw = r#"{
            "github": { "app_id": 1, "private_key_path": "/k.pem", "webhook_secret": "hook-secret" },
            "llm": { "api_key": "sk-very-secret" }
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        let dump = format!("{config:?}");

        assert!(!dump.contains("hook-secret"));
        assert!(!dump.contains("sk-very-secret"));
        assert!(dump.contains("[REDACTED]"));
    }

    #[test]
    fn test_framework_override_parses() {
        let raw = r#"{
            "github": { "app_id": 1, "private_key_path": "/k.pem", "webhook_secret": "s" },
            "llm": { "api_key": "k" },
            "workflow": { "test_framework": "pytest", "test_command": "pytest -q" }
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.workflow.test_framework, Some(Framework::Pytest));
    }
}
