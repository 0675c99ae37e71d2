//! Isolated, branch-backed working copies for concurrent agent sessions.

pub mod error;
pub mod isolator;
pub mod runner;

pub use error::IsolationError;
pub use isolator::{
    IsolatedWorkspace, IsolatorConfig, MergeOutcome, ValidationReason, WorkspaceIsolator,
    WorkspaceOwner, WorkspaceSummary, WorkspaceValidation,
};
pub use runner::{CommandRunner, ProcessCommandRunner};
