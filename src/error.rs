//! Error types for sandboxed agent sessions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for session, agent and sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration is incomplete or invalid. Raised before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The agent backend rejected the credential.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The agent backend is temporarily unreachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The agent backend produced output that could not be parsed.
    #[error("invalid response from agent: {0}")]
    InvalidResponse(String),

    /// Sandbox provisioning did not complete in time.
    #[error("sandbox provisioning timed out after {0} seconds")]
    ProvisionTimeout(u64),

    /// The provider refuses to create more sandboxes.
    #[error("sandbox quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No live sandbox is bound to the session.
    #[error("sandbox is not ready")]
    SandboxNotReady,

    /// A generation is already running on this session.
    #[error("session is busy with another request")]
    SessionBusy,

    /// The session has been killed.
    #[error("session has been released")]
    SessionReleased,

    /// The request was cancelled by a session kill.
    #[error("request cancelled")]
    Cancelled,

    /// A command inside the sandbox could not be run.
    #[error("sandbox operation failed: {0}")]
    Sandbox(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Serializable classification of an [`Error`], carried by error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    BackendUnavailable,
    InvalidResponse,
    ProvisionTimeout,
    QuotaExceeded,
    SandboxNotReady,
    SessionBusy,
    SessionReleased,
    Cancelled,
    Sandbox,
    Io,
}

impl Error {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::ConfigParse(_) => ErrorKind::Configuration,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Error::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Error::ProvisionTimeout(_) => ErrorKind::ProvisionTimeout,
            Error::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Error::SandboxNotReady => ErrorKind::SandboxNotReady,
            Error::SessionBusy => ErrorKind::SessionBusy,
            Error::SessionReleased => ErrorKind::SessionReleased,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Sandbox(_) => ErrorKind::Sandbox,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns true for failures that may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_) | Error::ProvisionTimeout(_)
        )
    }

    /// Returns true for errors caused by how the caller used the session.
    ///
    /// These are returned to the caller but never published as events.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::SandboxNotReady | Error::SessionBusy | Error::SessionReleased
        )
    }
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
