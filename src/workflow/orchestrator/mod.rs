//! Phase orchestration for a single run.
//!
//! [`Orchestrator::advance`] performs exactly one phase action under a run
//! lease and persists after every state mutation, so a crash at any await
//! point resumes from the last write. [`Orchestrator::drive`] loops until a
//! terminal phase and is the only place transient errors are retried.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::error::{AppError, ErrorClass, Result};
use crate::llm::{LlmClient, Prompt, RetryPolicy, TaskKind};
use crate::results::{self, Budget, Framework, ParsedTestResult};
use crate::workflow::artifacts::{self, EditSet};
use crate::workflow::collaborators::{
    CommitOutcome, IssueTracker, TestRunner, VersionControl, WorkItem,
};
use crate::workflow::lease::LeasedRun;
use crate::workflow::prompt;
use crate::workflow::state::{IssueClass, Phase, RunId, WorkItemKey, WorkflowState};
use crate::workflow::store::{StateStore, StoredRun};

pub const CAUSE_RESOLUTION_EXHAUSTED: &str = "resolution attempts exhausted";
pub const CAUSE_UPSTREAM_UNREACHABLE: &str = "upstream service unreachable";
pub const CAUSE_UNCLASSIFIED_OUTPUT: &str = "could not classify test output";
pub const CAUSE_REVIEW_UNRESOLVED: &str = "review blocking issues unresolved";

const FALLBACK_COMMIT_MESSAGE: &str = "Apply generated changes";

/// Longest single sleep while waiting on another holder's lease.
const LEASE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_test_retries: u32,
    pub max_review_retries: u32,
    pub max_advance_attempts: u32,
    pub failure_budget: Budget,
    pub lease_ttl: Duration,
    pub require_tracker: bool,
    pub test_framework: Option<Framework>,
    /// Backoff between `drive` attempts after a transient error.
    pub backoff: RetryPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let workflow = &config.workflow;
        Self {
            max_test_retries: workflow.max_test_retries,
            max_review_retries: workflow.max_review_retries,
            max_advance_attempts: workflow.max_advance_attempts,
            failure_budget: Budget::tokens(workflow.failure_budget_tokens),
            lease_ttl: workflow.lease_ttl(),
            require_tracker: workflow.require_tracker,
            test_framework: workflow.test_framework,
            backoff: config.llm.retry.policy(),
        }
    }
}

/// The per-run collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub tracker: Arc<dyn IssueTracker>,
    pub vcs: Arc<dyn VersionControl>,
    pub runner: Arc<dyn TestRunner>,
}

pub struct Orchestrator {
    llm: Arc<LlmClient>,
    store: Arc<dyn StateStore>,
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    holder: String,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<LlmClient>,
        store: Arc<dyn StateStore>,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            llm,
            store,
            collaborators,
            settings,
            holder: format!("hypha-{}", uuid::Uuid::new_v4().simple()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Load the persisted run, or create and persist a fresh one in `Plan`.
    pub async fn resume(&self, run_id: &RunId, work_item: &WorkItemKey) -> Result<WorkflowState> {
        if let Some(record) = self.store.load(run_id).await? {
            if &record.state.work_item != work_item {
                return Err(AppError::Config(format!(
                    "run {run_id} belongs to {}, not {work_item}",
                    record.state.work_item
                )));
            }
            tracing::info!(run_id = %run_id, phase = %record.state.phase, "Resuming run");
            return Ok(record.state);
        }

        let state = WorkflowState::new(run_id.clone(), work_item.clone());
        match self
            .store
            .compare_and_swap(run_id, None, StoredRun::new(state.clone()))
            .await
        {
            Ok(_) => {
                tracing::info!(run_id = %run_id, work_item = %work_item, "Created run");
                Ok(state)
            }
            // Created concurrently: use theirs.
            Err(AppError::Conflict(_)) => self
                .store
                .load(run_id)
                .await?
                .map(|r| r.state)
                .ok_or_else(|| AppError::Store(format!("run {run_id} vanished after create"))),
            Err(e) => Err(e),
        }
    }

    /// Run until `Done` or `Failed`.
    pub async fn drive(&self, run_id: &RunId, work_item: &WorkItemKey) -> Result<WorkflowState> {
        let span = tracing::info_span!("run", run_id = %run_id, work_item = %work_item);
        async move {
            let mut state = self.resume(run_id, work_item).await?;
            let max_attempts = self.settings.max_advance_attempts.max(1);
            let mut attempt = 1;

            while !state.is_terminal() {
                let phase = state.phase;
                match self.advance(state.clone()).await {
                    Ok(next) => {
                        state = next;
                        attempt = 1;
                    }
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    // Another holder owns the run: wait it out without spending attempts.
                    Err(AppError::LeaseHeld { holder, .. }) => {
                        self.wait_for_lease(run_id, &holder).await?;
                        state = self.current_state(run_id).await?;
                    }
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        let delay = self.settings.backoff.delay_for(attempt);
                        tracing::warn!(
                            %phase,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Phase hit a transient error, retrying"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                        state = self.current_state(run_id).await?;
                    }
                    Err(e) => {
                        let cause = match e.class() {
                            ErrorClass::Transient => {
                                format!("{CAUSE_UPSTREAM_UNREACHABLE}: {}", e.root())
                            }
                            _ => e.root().to_string(),
                        };
                        tracing::error!(%phase, error = %e, "Run failed");
                        return self.fail_run(run_id, e.class(), &cause).await;
                    }
                }
            }

            tracing::info!(phase = %state.phase, "Run finished");
            Ok(state)
        }
        .instrument(span)
        .await
    }

    /// Perform the next action for `state`'s run.
    ///
    /// The authoritative state is the one in the store; `state` identifies
    /// the run. Content errors fail the run and return the failed state;
    /// every other error is returned tagged with the phase it came from,
    /// leaving the last persisted state in place.
    pub async fn advance(&self, state: WorkflowState) -> Result<WorkflowState> {
        if state.is_terminal() {
            return Ok(state);
        }

        let run = LeasedRun::acquire(
            self.store.clone(),
            &state.run_id,
            &self.holder,
            self.settings.lease_ttl,
        )
        .await?;
        let mut state = run.state().await;
        let phase = state.phase;

        let action = async {
            match phase {
                Phase::Plan => self.plan(&run, &mut state).await,
                Phase::Build => self.build(&run, &mut state).await,
                Phase::Test => self.test(&run, &mut state).await,
                Phase::Review => self.review(&run, &mut state).await,
                Phase::Done | Phase::Failed => Ok(()),
            }
        };
        let result = with_heartbeat(&run, action).await;

        let outcome = match result {
            Ok(()) => Ok(()),
            Err(e) if e.class() == ErrorClass::Content => {
                let cause = content_cause(e.root());
                tracing::error!(run_id = %state.run_id, %phase, error = %e, "Unusable model output");
                // Drop any unsaved in-memory mutation before failing.
                state = run.state().await;
                self.fail_in_lease(&run, &mut state, ErrorClass::Content, &cause)
                    .await
            }
            Err(e) => Err(e.in_phase(phase)),
        };

        if let Err(release_err) = run.release().await {
            tracing::warn!(run_id = %state.run_id, error = %release_err, "Failed to release lease");
        }
        outcome?;

        if state.is_terminal() {
            self.llm.close_run(state.run_id.as_str()).await;
        }
        Ok(state)
    }

    /// Sleep until `holder`'s lease on the run lapses or is released.
    async fn wait_for_lease(&self, run_id: &RunId, holder: &str) -> Result<()> {
        loop {
            let lease = self.store.load(run_id).await?.and_then(|r| r.lease);
            let remaining = match lease {
                Some(lease) if lease.holder != self.holder => {
                    (lease.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                }
                _ => return Ok(()),
            };
            if remaining.is_zero() {
                return Ok(());
            }
            tracing::info!(
                run_id = %run_id,
                holder,
                wait_ms = remaining.as_millis() as u64,
                "Run is leased elsewhere, waiting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(remaining.min(LEASE_POLL)) => {}
            }
        }
    }

    async fn current_state(&self, run_id: &RunId) -> Result<WorkflowState> {
        self.store
            .load(run_id)
            .await?
            .map(|r| r.state)
            .ok_or_else(|| AppError::Store(format!("run {run_id} not found")))
    }

    /// Fail the run from outside a phase action.
    async fn fail_run(&self, run_id: &RunId, class: ErrorClass, cause: &str) -> Result<WorkflowState> {
        let run =
            LeasedRun::acquire(self.store.clone(), run_id, &self.holder, self.settings.lease_ttl)
                .await?;
        let mut state = run.state().await;
        let outcome = if state.is_terminal() {
            Ok(())
        } else {
            self.fail_in_lease(&run, &mut state, class, cause).await
        };
        if let Err(e) = run.release().await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to release lease");
        }
        outcome?;
        self.llm.close_run(run_id.as_str()).await;
        Ok(state)
    }

    async fn fail_in_lease(
        &self,
        run: &LeasedRun,
        state: &mut WorkflowState,
        class: ErrorClass,
        cause: &str,
    ) -> Result<()> {
        state.fail(class, cause)?;
        run.save(state).await?;
        // The run is already failed; a required tracker cannot fail it twice.
        if let Err(e) = self
            .notify(
                &state.work_item,
                &format!("Hypha run `{}` failed: {cause}", state.run_id),
            )
            .await
        {
            tracing::warn!(run_id = %state.run_id, error = %e, "Failed to report run failure");
        }
        Ok(())
    }

    // --- Phases ---

    async fn plan(&self, run: &LeasedRun, state: &mut WorkflowState) -> Result<()> {
        let key = state.work_item.clone();
        let item = self.collaborators.tracker.fetch_item(&key).await?;

        let class = match state.classification {
            Some(class) => class,
            None => {
                let class = self.classify(state, &item).await?;
                state.classification = Some(class);
                state.touch();
                run.save(state).await?;
                class
            }
        };

        // The name is persisted before the branch exists, so a retry reuses it.
        let branch = match state.branch.clone() {
            Some(branch) => branch,
            None => {
                let reply = self
                    .ask(state, TaskKind::BranchName, prompt::branch_name(&key, &item))
                    .await?;
                let slug = artifacts::parse_branch_slug(&reply)?;
                let branch = artifacts::branch_name(class, key.number, &state.run_id, &slug)?;
                state.set_branch(&branch)?;
                run.save(state).await?;
                branch
            }
        };
        self.collaborators.vcs.create_branch(&branch).await?;
        tracing::info!(run_id = %state.run_id, branch = %branch, "Branch ready");

        let reply = self.ask(state, TaskKind::Plan, prompt::plan(&key, &item)).await?;
        let plan = artifacts::validate_plan(&reply)?;

        let path = state.plan_path();
        self.collaborators.vcs.write_file(&path, Some(&plan)).await?;
        self.collaborators
            .vcs
            .commit(&[path.clone()], &format!("Add implementation plan for {key}"))
            .await?;
        state.set_plan_artifact(&path)?;
        state.transition(Phase::Build)?;
        run.save(state).await?;

        self.notify(
            &key,
            &format!(
                "Hypha run `{}` planned this as a **{class}** on branch `{}`.",
                state.run_id,
                state.branch()?
            ),
        )
        .await
    }

    async fn classify(&self, state: &WorkflowState, item: &WorkItem) -> Result<IssueClass> {
        if let Some(class) = item.labels.iter().find_map(|l| IssueClass::from_label(l)) {
            tracing::debug!(run_id = %state.run_id, %class, "Classified from labels");
            return Ok(class);
        }
        let reply = self
            .ask(state, TaskKind::Classify, prompt::classify(&state.work_item, item))
            .await?;
        artifacts::parse_classification(&reply)
    }

    async fn build(&self, run: &LeasedRun, state: &mut WorkflowState) -> Result<()> {
        let plan = self.read_plan(state).await?;
        let reply = self
            .ask(state, TaskKind::Implement, prompt::implement(&state.work_item, &plan))
            .await?;
        let edits = artifacts::parse_edit_set(&reply, "implementation")?;

        self.apply_and_commit(state, &edits).await?;
        state.transition(Phase::Test)?;
        run.save(state).await
    }

    async fn test(&self, run: &LeasedRun, state: &mut WorkflowState) -> Result<()> {
        let raw = self.cancellable(self.collaborators.runner.run()).await?;
        let parsed = results::parse(&raw.output, self.settings.test_framework.or(raw.framework_hint));
        let exited_badly = raw.exit_code.is_some_and(|c| c != 0);

        tracing::info!(
            run_id = %state.run_id,
            framework = %parsed.framework,
            total = parsed.total,
            passed = parsed.passed,
            failed = parsed.failed,
            exit_code = ?raw.exit_code,
            "Test run parsed"
        );

        if parsed.is_unclassified() || (parsed.failed == 0 && exited_badly) {
            return Err(AppError::UnclassifiedOutput(format!(
                "{} failures parsed, exit code {:?}",
                parsed.failed, raw.exit_code
            )));
        }

        if parsed.failed == 0 {
            return self.publish(run, state, &parsed).await;
        }

        if state.retries.test >= self.settings.max_test_retries {
            tracing::warn!(
                run_id = %state.run_id,
                attempts = state.retries.test,
                "Test resolution attempts exhausted"
            );
            state.fail(ErrorClass::Permanent, CAUSE_RESOLUTION_EXHAUSTED)?;
            run.save(state).await?;
            return self
                .notify(
                    &state.work_item,
                    &format!(
                        "Hypha run `{}` failed: {CAUSE_RESOLUTION_EXHAUSTED} ({} failing tests).",
                        state.run_id, parsed.failed
                    ),
                )
                .await;
        }

        let previous: HashSet<String> = state.last_failures.iter().cloned().collect();
        let payload = results::compress_with_history(
            &parsed,
            self.settings.failure_budget,
            (!previous.is_empty()).then_some(&previous),
        );

        state.retries.test += 1;
        state.last_failures = parsed.failure_names();
        state.touch();
        run.save(state).await?;
        let attempt = state.retries.test;
        tracing::info!(
            run_id = %state.run_id,
            attempt,
            failures = parsed.failed,
            omitted = payload.omitted,
            budget_used = payload.budget_used,
            "Resolving test failures"
        );

        let plan = self.read_plan(state).await?;
        let reply = self
            .ask(
                state,
                TaskKind::PatchPlan,
                prompt::patch_failures(&state.work_item, &plan, &payload.render(), attempt),
            )
            .await?;
        let edits = artifacts::parse_edit_set(&reply, "test fix")?;

        self.apply_and_commit(state, &edits).await?;
        state.transition(Phase::Test)?;
        run.save(state).await
    }

    /// All tests pass: push and open the change request.
    async fn publish(
        &self,
        run: &LeasedRun,
        state: &mut WorkflowState,
        parsed: &ParsedTestResult,
    ) -> Result<()> {
        let branch = state.branch()?.to_string();
        self.collaborators.vcs.push().await?;
        let number = self
            .collaborators
            .vcs
            .open_or_update_change_request(
                &branch,
                &self.change_request_title(state).await,
                &format!(
                    "Resolves {}.\n\nTests: {} passed, {} skipped.\n\nPlan: `{}`",
                    state.work_item,
                    parsed.passed,
                    parsed.skipped,
                    state.plan_path()
                ),
            )
            .await?;

        state.change_request = Some(number);
        state.last_failures.clear();
        state.transition(Phase::Review)?;
        run.save(state).await?;

        self.notify(
            &state.work_item,
            &format!("Hypha run `{}`: tests pass, opened #{number} for review.", state.run_id),
        )
        .await
    }

    async fn review(&self, run: &LeasedRun, state: &mut WorkflowState) -> Result<()> {
        let plan = self.read_plan(state).await?;
        let diff = self.collaborators.vcs.diff().await?;
        let reply = self
            .ask(state, TaskKind::Review, prompt::review(&state.work_item, &plan, &diff))
            .await?;
        let report = artifacts::parse_review(&reply)?;
        let blockers = report.blocking_issues();

        if blockers.is_empty() {
            let branch = state.branch()?.to_string();
            self.collaborators.vcs.push().await?;
            let number = self
                .collaborators
                .vcs
                .open_or_update_change_request(
                    &branch,
                    &self.change_request_title(state).await,
                    &format!(
                        "Resolves {}.\n\n## Review\n{}",
                        state.work_item, report.summary
                    ),
                )
                .await?;
            state.change_request = Some(number);
            state.transition(Phase::Done)?;
            run.save(state).await?;

            return self
                .notify(
                    &state.work_item,
                    &format!(
                        "Hypha run `{}` finished: #{number} is ready.\n\n{}",
                        state.run_id, report.summary
                    ),
                )
                .await;
        }

        if state.retries.review >= self.settings.max_review_retries {
            state.fail(ErrorClass::Permanent, CAUSE_REVIEW_UNRESOLVED)?;
            run.save(state).await?;
            return self
                .notify(
                    &state.work_item,
                    &format!(
                        "Hypha run `{}` failed: {CAUSE_REVIEW_UNRESOLVED} ({} blockers).",
                        state.run_id,
                        blockers.len()
                    ),
                )
                .await;
        }

        state.retries.review += 1;
        state.touch();
        run.save(state).await?;
        let attempt = state.retries.review;
        tracing::info!(
            run_id = %state.run_id,
            attempt,
            blockers = blockers.len(),
            "Resolving review blockers"
        );

        let reply = self
            .ask(
                state,
                TaskKind::PatchPlan,
                prompt::patch_review(&state.work_item, &plan, &blockers, attempt),
            )
            .await?;
        let edits = artifacts::parse_edit_set(&reply, "review fix")?;

        self.apply_and_commit(state, &edits).await?;
        state.transition(Phase::Test)?;
        run.save(state).await
    }

    // --- Helpers ---

    async fn ask(&self, state: &WorkflowState, task: TaskKind, prompt: Prompt) -> Result<String> {
        self.cancellable(self.llm.ask(state.run_id.as_str(), task, &prompt))
            .await
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AppError::Cancelled),
            result = fut => result,
        }
    }

    async fn read_plan(&self, state: &WorkflowState) -> Result<String> {
        let path = state
            .plan_artifact
            .clone()
            .unwrap_or_else(|| state.plan_path());
        self.collaborators.vcs.read_file(&path).await
    }

    async fn apply_and_commit(&self, state: &WorkflowState, edits: &EditSet) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        for edit in &edits.files {
            let content = if edit.delete { None } else { edit.content.as_deref() };
            self.collaborators.vcs.write_file(&edit.path, content).await?;
        }

        let paths = edits.paths();
        let message = self.commit_message(state, edits, &paths).await?;
        match self.collaborators.vcs.commit(&paths, &message).await? {
            CommitOutcome::Committed(sha) => {
                tracing::info!(run_id = %state.run_id, %sha, files = paths.len(), "Committed changes");
            }
            CommitOutcome::NothingToCommit => {
                tracing::info!(run_id = %state.run_id, "Edit set produced no changes");
            }
        }
        Ok(())
    }

    async fn commit_message(
        &self,
        state: &WorkflowState,
        edits: &EditSet,
        paths: &[String],
    ) -> Result<String> {
        let summary = edits.summary.as_deref().unwrap_or("(no summary)");
        let reply = self
            .ask(state, TaskKind::CommitMessage, prompt::commit_message(summary, paths))
            .await?;
        match artifacts::parse_commit_message(&reply) {
            Ok(message) => Ok(message),
            Err(e) => {
                tracing::debug!(run_id = %state.run_id, error = %e, "Using fallback commit message");
                Ok(format!("{FALLBACK_COMMIT_MESSAGE} for {}", state.work_item))
            }
        }
    }

    async fn change_request_title(&self, state: &WorkflowState) -> String {
        match self.collaborators.tracker.fetch_item(&state.work_item).await {
            Ok(item) => format!("{} (#{})", item.title, state.work_item.number),
            Err(e) => {
                tracing::warn!(run_id = %state.run_id, error = %e, "Could not fetch issue title");
                format!("Resolve {}", state.work_item)
            }
        }
    }

    /// Post a progress comment. Failures are logged unless the tracker is required.
    async fn notify(&self, key: &WorkItemKey, body: &str) -> Result<()> {
        match self.collaborators.tracker.post_comment(key, body).await {
            Ok(()) => Ok(()),
            Err(e) if self.settings.require_tracker => Err(e),
            Err(e) => {
                tracing::warn!(work_item = %key, error = %e, "Failed to post progress comment");
                Ok(())
            }
        }
    }
}

/// Run `action` while renewing the lease at a third of its TTL.
///
/// Losing the lease aborts the action, so a holder that was taken over
/// stops before its next side effect.
async fn with_heartbeat<T>(run: &LeasedRun, action: impl Future<Output = Result<T>>) -> Result<T> {
    let every = (run.ttl() / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    tokio::pin!(action);
    loop {
        tokio::select! {
            result = &mut action => return result,
            _ = ticker.tick() => {
                if let Err(e) = run.renew().await {
                    tracing::warn!(error = %e, "Lost run lease, abandoning action");
                    return Err(e);
                }
            }
        }
    }
}

fn content_cause(err: &AppError) -> String {
    match err {
        AppError::Content { artifact, .. } => {
            format!("LLM response could not be mapped to {artifact}")
        }
        AppError::UnclassifiedOutput(_) => CAUSE_UNCLASSIFIED_OUTPUT.to_string(),
        other => other.to_string(),
    }
}
