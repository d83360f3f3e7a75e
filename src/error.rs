//! Application-wide error types.

use thiserror::Error;

use crate::types::GroupId;

/// Exit status for a missing or malformed node identity.
pub const EXIT_IDENTITY: i32 = 2;
/// Exit status for a group whose ledger stack could not be built.
pub const EXIT_BOOTSTRAP: i32 = 3;
/// Exit status for every other startup failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("bootstrap error (group {group}): {reason}")]
    Bootstrap { group: GroupId, reason: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("sequencer error: {0}")]
    Sequencer(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn bootstrap(group: GroupId, reason: impl Into<String>) -> Self {
        AppError::Bootstrap { group, reason: reason.into() }
    }

    /// Process exit status for this error.
    ///
    /// Identity and bootstrap failures are both fatal but report different
    /// codes so operators can tell them apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Identity(_) => EXIT_IDENTITY,
            AppError::Bootstrap { .. } | AppError::Registry(_) => EXIT_BOOTSTRAP,
            _ => EXIT_FAILURE,
        }
    }
}
