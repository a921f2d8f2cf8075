pub mod artifacts;
pub mod collaborators;
pub mod lease;
pub mod orchestrator;
pub mod prompt;
pub mod state;
pub mod store;

pub use collaborators::{
    CommitOutcome, IssueTracker, RawTestOutput, TestRunner, VersionControl, WorkItem,
};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
pub use state::{IssueClass, Phase, RunId, WorkItemKey, WorkflowState};
pub use store::{FileStateStore, MemoryStateStore, StateStore, StoredRun};
