//! Error types for the update subsystem.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, UpdateError>;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("invalid version format: {0:?}")]
    InvalidVersionFormat(String),

    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("release source unavailable: {0}")]
    ReleaseSourceUnavailable(String),

    #[error("update to {target} denied by lock policy: {reason}")]
    LockDenied { target: String, reason: String },

    #[error("another update is already in progress ({holder})")]
    ConcurrentUpdateDenied { holder: String },

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("installed version {installed} does not match requested {requested}")]
    InstallVerificationMismatch {
        requested: String,
        installed: String,
    },

    #[error("step '{step}' failed critically, resume is disabled: {reason}")]
    CriticalStepFailure { step: String, reason: String },

    #[error("no backup available to restore")]
    NoBackupAvailable,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("invalid channel operation: {0}")]
    InvalidChannelOperation(String),

    #[error("no update is in progress")]
    NoActiveUpdate,

    #[error("install command failed: {0}")]
    InstallFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
