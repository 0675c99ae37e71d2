use fleet_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session failed: {0}")]
    Failed(String),
    #[error("session operation not supported: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
pub enum TaskSourceError {
    #[error("task source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("worker pool is already running")]
    AlreadyRunning,
    #[error("worker pool is not running")]
    NotRunning,
    #[error("worker pool is not draining")]
    NotDraining,
    #[error("unknown worker: {0}")]
    UnknownWorker(String),
    #[error("worker has no active session")]
    NoActiveSession,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
