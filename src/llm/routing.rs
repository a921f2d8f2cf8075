use serde::{Deserialize, Serialize};

/// Routing class for a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Heavy,
    Lightweight,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Heavy => f.write_str("heavy"),
            ModelTier::Lightweight => f.write_str("lightweight"),
        }
    }
}

/// Per-call timeout selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Short,
    Long,
}

/// The kinds of request the workflow makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Classify,
    BranchName,
    CommitMessage,
    Plan,
    Implement,
    PatchPlan,
    Review,
}

impl TaskKind {
    pub fn tier(&self) -> ModelTier {
        match self {
            TaskKind::Classify | TaskKind::BranchName | TaskKind::CommitMessage => {
                ModelTier::Lightweight
            }
            TaskKind::Plan | TaskKind::Implement | TaskKind::PatchPlan | TaskKind::Review => {
                ModelTier::Heavy
            }
        }
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self.tier() {
            ModelTier::Heavy => TimeoutClass::Long,
            ModelTier::Lightweight => TimeoutClass::Short,
        }
    }

    /// Conversation slot suffix, e.g. `a1b2c3d4/plan`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Classify => "classify",
            TaskKind::BranchName => "branch_name",
            TaskKind::CommitMessage => "commit_message",
            TaskKind::Plan => "plan",
            TaskKind::Implement => "implement",
            TaskKind::PatchPlan => "patch_plan",
            TaskKind::Review => "review",
        }
    }
}

/// Model names per tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoutes {
    pub heavy: String,
    pub lightweight: String,
}

impl ModelRoutes {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Heavy => &self.heavy,
            ModelTier::Lightweight => &self.lightweight,
        }
    }
}
