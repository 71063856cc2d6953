//! Error taxonomy for the sync session core.
//!
//! The core distinguishes *kinds* of failure because each kind is
//! handled differently by the session controller (see `session`):
//! datastore errors are per-source and don't abort siblings, transport
//! errors allow one more engine shutdown step, config/credential errors
//! must surface before the driver loop starts at all.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("datastore error in source '{source_name}': {detail}")]
    Datastore { source_name: String, detail: String },

    #[error("local error: {0}")]
    Local(String),

    #[error("sync aborted")]
    Aborted,

    #[error("sync suspended")]
    Suspended,

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Local(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Local(e.to_string())
    }
}

impl SyncError {
    pub fn datastore(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        SyncError::Datastore {
            source_name: source_name.into(),
            detail: detail.into(),
        }
    }

    /// True for errors the session controller should not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_) | SyncError::Credentials(_))
    }
}
