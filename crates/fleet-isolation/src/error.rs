use thiserror::Error;

#[derive(Debug, Error)]
pub enum IsolationError {
    /// The version-control tool rejected creating the branch or working copy.
    #[error("workspace isolation failed: {0}")]
    Isolation(String),
    /// `recreate` was asked to repair a workspace that is fully usable.
    #[error("workspace is already valid")]
    AlreadyValid,
    /// A vcs operation failed for a reason other than a merge/rebase conflict.
    #[error("vcs operation failed: {0}")]
    OperationFailed(String),
    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
}
