use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use fleet_isolation::{IsolatedWorkspace, IsolationError, MergeOutcome, WorkspaceOwner};
use fleet_protocol::InstanceId;

use crate::error::{SessionError, TaskSourceError};

/// Where workers learn how much work is waiting. Errors are recoverable:
/// the pool reports them and treats availability as zero for that tick.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn ready_count(&self) -> Result<usize, TaskSourceError>;
}

/// Everything a runner needs to drive one agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub instance_id: InstanceId,
    pub workspace_path: PathBuf,
    pub branch: String,
}

/// Drives one agent session to completion inside an isolated workspace.
///
/// `pause`/`resume` keep the underlying session alive and are distinct from
/// interruption; backends that cannot support them keep the defaults.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn run_session(&self, session: &SessionContext) -> Result<(), SessionError>;

    /// Best-effort early termination of a session in flight.
    async fn interrupt(&self, _instance: &InstanceId) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("interrupt"))
    }

    async fn pause(&self, _instance: &InstanceId) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("pause"))
    }

    async fn resume(&self, _instance: &InstanceId) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("resume"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub success: bool,
    pub output: String,
}

/// Runs the project's verification suite in the trunk working copy. The
/// caller holds the trunk guard for the duration of the run.
#[async_trait]
pub trait VerificationRunner: Send + Sync {
    async fn run_verification(&self, trunk: &Path) -> VerificationOutcome;
}

/// Workspace lifecycle as the pool consumes it: acquire-or-repair, merge
/// back, release. The production implementation adapts `WorkspaceIsolator`.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn acquire(&self, owner: &WorkspaceOwner) -> Result<IsolatedWorkspace, IsolationError>;

    async fn merge(&self, owner: &WorkspaceOwner) -> Result<MergeOutcome, IsolationError>;

    /// Discards a conflicted merge left in the trunk.
    async fn discard_merge(&self) -> Result<(), IsolationError>;

    async fn release(&self, owner: &WorkspaceOwner) -> Result<(), IsolationError>;

    /// Exclusive hold on the trunk working copy, serialized against merges.
    async fn lock_trunk(&self) -> OwnedMutexGuard<()>;

    fn trunk_path(&self) -> &Path;
}

/// Maps live counts to a desired worker count each poll tick.
pub trait SizingPolicy: Send + Sync {
    fn target_workers(&self, available: usize, max_workers: usize, active: usize) -> usize;
}

/// Default policy: one worker per ready task, capped at the configured
/// maximum. Never forces scale-down of busy workers.
#[derive(Debug, Default)]
pub struct AvailabilityCap;

impl SizingPolicy for AvailabilityCap {
    fn target_workers(&self, available: usize, max_workers: usize, _active: usize) -> usize {
        available.min(max_workers)
    }
}
