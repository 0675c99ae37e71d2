use fleet_session_store::StateStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance id already registered: {0}")]
    DuplicateId(String),
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("no session state store attached")]
    NoStateStore,
    #[error("session state store error: {0}")]
    StateStore(#[from] StateStoreError),
}
