use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::platform::GitHubTracker;
use crate::server::AppState;
use crate::workflow::{Collaborators, Orchestrator, OrchestratorSettings, RunId, WorkItemKey, WorkflowState};
use crate::workspace::{CommandTestRunner, GitVersionControl};

/// Wire up the collaborators for one run and drive it to completion.
///
/// The working copy is removed once the run reaches a terminal phase and
/// kept otherwise, so a resumed run continues from its local commits.
pub async fn execute_run(
    state: &AppState,
    run_id: &RunId,
    key: &WorkItemKey,
    cancel: CancellationToken,
) -> Result<WorkflowState> {
    let platform = Arc::clone(&state.platform);
    let repo = platform.get_repository(key.installation_id, &key.repo).await?;
    let token = platform.get_access_token(key.installation_id).await?;
    let workspace = state.workspaces.setup_for_run(&repo, &token, run_id).await?;

    let workflow = &state.config.workflow;
    let collaborators = Collaborators {
        tracker: Arc::new(GitHubTracker::new(Arc::clone(&platform))),
        vcs: Arc::new(GitVersionControl::new(
            Arc::clone(&platform),
            key,
            workspace.clone(),
        )),
        runner: Arc::new(CommandTestRunner::new(
            workspace.path.clone(),
            workflow.test_command.clone(),
            workflow.test_timeout(),
        )),
    };

    let orchestrator = Orchestrator::new(
        Arc::clone(&state.llm),
        Arc::clone(&state.store),
        collaborators,
        OrchestratorSettings::from_config(&state.config),
    )
    .with_cancellation(cancel);

    let final_state = orchestrator.drive(run_id, key).await?;

    if let Err(e) = state.workspaces.cleanup(&workspace).await {
        tracing::warn!(run_id = %run_id, error = %e, "Failed to remove workspace");
    }
    Ok(final_state)
}
