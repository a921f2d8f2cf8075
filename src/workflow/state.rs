use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorClass, Result};

/// Pipeline phase. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plan,
    Build,
    Test,
    Review,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    pub fn can_transition_to(&self, to: Phase) -> bool {
        matches!(
            (self, to),
            (Phase::Plan, Phase::Build | Phase::Failed)
                | (Phase::Build, Phase::Test | Phase::Failed)
                | (Phase::Test, Phase::Test | Phase::Review | Phase::Failed)
                | (Phase::Review, Phase::Test | Phase::Done | Phase::Failed)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Plan => "Plan",
            Phase::Build => "Build",
            Phase::Test => "Test",
            Phase::Review => "Review",
            Phase::Done => "Done",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Short run identifier: 8 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(uuid[..8].to_string())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let valid = raw.len() == 8
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(AppError::Config(format!("invalid run id: {raw:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The issue a run works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemKey {
    pub installation_id: u64,
    /// `owner/name`
    pub repo: String,
    pub number: u64,
}

impl std::fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueClass {
    Bug,
    Feature,
    Chore,
}

impl IssueClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueClass::Bug => "bug",
            IssueClass::Feature => "feature",
            IssueClass::Chore => "chore",
        }
    }

    /// Map a tracker label such as `bug`, `type: feature` or `enhancement`.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.to_ascii_lowercase();
        let label = label.rsplit([':', '/']).next().unwrap_or(&label).trim();
        match label {
            "bug" | "defect" | "fix" => Some(IssueClass::Bug),
            "feature" | "enhancement" | "feat" => Some(IssueClass::Feature),
            "chore" | "maintenance" | "refactor" | "dependencies" => Some(IssueClass::Chore),
            _ => None,
        }
    }
}

impl std::fmt::Display for IssueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    pub test: u32,
    pub review: u32,
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: Phase,
    pub class: ErrorClass,
    pub cause: String,
}

/// Durable state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: RunId,
    pub work_item: WorkItemKey,
    pub phase: Phase,
    pub branch: Option<String>,
    pub plan_artifact: Option<String>,
    pub classification: Option<IssueClass>,
    #[serde(default)]
    pub retries: RetryCounters,
    #[serde(default)]
    pub last_failures: Vec<String>,
    pub change_request: Option<u64>,
    pub failure: Option<FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(run_id: RunId, work_item: WorkItemKey) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            work_item,
            phase: Phase::Plan,
            branch: None,
            plan_artifact: None,
            classification: None,
            retries: RetryCounters::default(),
            last_failures: Vec::new(),
            change_request: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn transition(&mut self, to: Phase) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(AppError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        tracing::info!(run_id = %self.run_id, from = %self.phase, to = %to, "Phase transition");
        self.phase = to;
        self.touch();
        Ok(())
    }

    /// Move to `Failed`, recording where and why.
    pub fn fail(&mut self, class: ErrorClass, cause: impl Into<String>) -> Result<()> {
        let record = FailureRecord {
            phase: self.phase,
            class,
            cause: cause.into(),
        };
        self.transition(Phase::Failed)?;
        self.failure = Some(record);
        Ok(())
    }

    pub fn set_branch(&mut self, branch: &str) -> Result<()> {
        set_once(&mut self.branch, branch, self.phase)?;
        self.touch();
        Ok(())
    }

    pub fn set_plan_artifact(&mut self, path: &str) -> Result<()> {
        set_once(&mut self.plan_artifact, path, self.phase)?;
        self.touch();
        Ok(())
    }

    pub fn branch(&self) -> Result<&str> {
        self.branch
            .as_deref()
            .ok_or_else(|| AppError::Internal(format!("run {} has no branch", self.run_id)))
    }

    pub fn plan_path(&self) -> String {
        format!("specs/plan-{}.md", self.run_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Write-once fields accept the same value again; a different value is rejected.
fn set_once(field: &mut Option<String>, value: &str, phase: Phase) -> Result<()> {
    match field {
        Some(existing) if existing == value => Ok(()),
        Some(_) => Err(AppError::InvalidTransition { from: phase, to: phase }),
        None => {
            *field = Some(value.to_string());
            Ok(())
        }
    }
}
