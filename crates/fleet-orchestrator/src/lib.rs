//! Autoscaling orchestration of concurrent agent sessions.
//!
//! The pool sizes itself against task availability each poll tick and runs
//! one session per worker at a time, each inside its own isolated workspace.
//! Draining lets in-flight sessions finish while refusing new ones.

pub mod error;
pub mod isolation;
pub mod pool;
pub mod state;
pub mod traits;

pub use error::{OrchestratorError, SessionError, TaskSourceError};
pub use isolation::IsolatedWorkspaceProvider;
pub use pool::{PoolBuilder, PoolConfig, WorkerPool};
pub use state::{PoolEvent, PoolState, PoolStatus};
pub use traits::{
    AvailabilityCap, SessionContext, SessionRunner, SizingPolicy, TaskSource,
    VerificationOutcome, VerificationRunner, WorkspaceProvider,
};
