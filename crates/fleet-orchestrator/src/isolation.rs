use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use fleet_isolation::{
    CommandRunner, IsolatedWorkspace, IsolationError, MergeOutcome, ValidationReason,
    WorkspaceIsolator, WorkspaceOwner,
};

use crate::traits::WorkspaceProvider;

/// Production workspace provider over git worktrees.
///
/// `acquire` is self-healing: a fully valid workspace is reused as-is, a
/// never-provisioned one is created, and anything in between is repaired.
pub struct IsolatedWorkspaceProvider<R: CommandRunner> {
    isolator: WorkspaceIsolator<R>,
    shared_context: Vec<PathBuf>,
}

impl<R: CommandRunner> IsolatedWorkspaceProvider<R> {
    pub fn new(isolator: WorkspaceIsolator<R>, shared_context: Vec<PathBuf>) -> Self {
        Self {
            isolator,
            shared_context,
        }
    }
}

#[async_trait]
impl<R: CommandRunner> WorkspaceProvider for IsolatedWorkspaceProvider<R> {
    async fn acquire(&self, owner: &WorkspaceOwner) -> Result<IsolatedWorkspace, IsolationError> {
        let validation = self.isolator.validate(owner).await?;
        let workspace = if validation.is_valid {
            IsolatedWorkspace {
                path: self.isolator.workspace_path(owner),
                branch: self.isolator.branch_name(owner),
                owner: owner.clone(),
            }
        } else if validation.reason == ValidationReason::NeverExisted {
            self.isolator.create(owner).await?
        } else {
            tracing::debug!(
                owner = %owner.slug(),
                reason = ?validation.reason,
                "repairing workspace before acquisition"
            );
            self.isolator.recreate(owner).await?
        };

        if !self.shared_context.is_empty() {
            self.isolator
                .copy_shared_context(&workspace.path, &self.shared_context)
                .await?;
        }
        Ok(workspace)
    }

    async fn merge(&self, owner: &WorkspaceOwner) -> Result<MergeOutcome, IsolationError> {
        self.isolator.merge(owner).await
    }

    async fn discard_merge(&self) -> Result<(), IsolationError> {
        self.isolator.abort_merge().await
    }

    async fn release(&self, owner: &WorkspaceOwner) -> Result<(), IsolationError> {
        self.isolator.remove(owner, true).await
    }

    async fn lock_trunk(&self) -> OwnedMutexGuard<()> {
        self.isolator.lock_trunk().await
    }

    fn trunk_path(&self) -> &Path {
        &self.isolator.config().trunk_path
    }
}
