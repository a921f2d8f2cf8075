use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::llm::LlmClient;
use crate::platform::github::GitHubPlatform;
use crate::platform::Platform;
use crate::queue::RunQueue;
use crate::workflow::{FileStateStore, RunId, StateStore, WorkflowState};
use crate::workspace::WorkspaceManager;

/// Process-wide clients, built once and shared by every run.
pub struct AppState {
    pub config: AppConfig,
    pub platform: Arc<dyn Platform>,
    pub llm: Arc<LlmClient>,
    pub store: Arc<dyn StateStore>,
    pub workspaces: WorkspaceManager,
    pub runs: RunQueue,
}

impl AppState {
    pub async fn new(config: AppConfig) -> crate::error::Result<Self> {
        let platform = Arc::new(GitHubPlatform::new(&config.github).await?);
        let llm = Arc::new(LlmClient::from_config(&config.llm));
        let store = Arc::new(FileStateStore::new(&config.state.dir));
        let workspaces = WorkspaceManager::new(&config.workspace);
        let runs = RunQueue::new(config.workflow.max_concurrent_runs);

        Ok(Self {
            config,
            platform,
            llm,
            store,
            workspaces,
            runs,
        })
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/github", post(crate::webhook::handler::handle_webhook))
        .route("/runs/:run_id", get(run_status))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn run_status(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<WorkflowState>, StatusCode> {
    let run_id = RunId::parse(&run_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    match state.store.load(&run_id).await {
        Ok(Some(record)) => Ok(Json(record.state)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Failed to load run");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
