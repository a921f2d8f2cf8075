pub mod git;
pub mod manager;
pub mod runner;
pub mod vcs;

pub use manager::{Workspace, WorkspaceManager};
pub use runner::CommandTestRunner;
pub use vcs::GitVersionControl;
