use thiserror::Error;

use crate::mask::MaskError;
use crate::persistence::PersistenceError;
use crate::protocol::ProtocolError;

/// Crate-wide error for shared-document operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A document root was used before its `initialize_*` call.
    #[error("{0} used before initialization")]
    NotInitialized(&'static str),
    #[error("document for room {0} has been destroyed")]
    Destroyed(String),
    #[error("scene {0} has no replicated data")]
    SceneNotFound(String),
    #[error("no active scene selected")]
    NoActiveScene,
    #[error("invalid property path: {0:?}")]
    InvalidPath(Vec<String>),
    #[error("CRDT error: {0}")]
    Crdt(String),
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Mask(#[from] MaskError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type SyncResult<T> = Result<T, SyncError>;
