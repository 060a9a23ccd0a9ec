//! Error types shared by discovery, resolution and orchestration.
//!
//! [`ScanError`] is `Clone` so a single in-flight result (value or error)
//! can be handed to every caller waiting on the same cache key.

use std::path::PathBuf;

/// Errors produced while discovering, resolving or scanning projects.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    /// A project is missing a field it needs before it can be queried.
    #[error("validation failed for {project}: {reason}")]
    Validation { project: String, reason: String },

    /// The advisory source could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The advisory source answered with a non-success status.
    #[error("advisory source responded with status {status}: {message}")]
    Status { status: u16, message: String },

    /// A response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The circuit breaker rejected the call without attempting it.
    #[error("circuit breaker '{name}' is open, call rejected")]
    CircuitOpen { name: String },

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A manifest file could not be parsed into a project.
    #[error("failed to parse manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("io error: {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    /// Device-flow authentication ended without a token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A spawned task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),

    /// A failure attributed to one project.
    #[error("scan of {service}/{project} failed: {source}")]
    Project {
        service: String,
        project: String,
        #[source]
        source: Box<ScanError>,
    },
}

impl ScanError {
    pub fn manifest(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ScanError::Manifest {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        ScanError::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Wraps `self` with the identity of the project that produced it.
    pub fn for_project(self, service: impl Into<String>, project: impl Into<String>) -> Self {
        ScanError::Project {
            service: service.into(),
            project: project.into(),
            source: Box::new(self),
        }
    }

    /// True for failures of the outbound call itself, including breaker
    /// rejections.
    pub fn is_transport(&self) -> bool {
        match self {
            ScanError::Transport(_)
            | ScanError::Status { .. }
            | ScanError::Decode(_)
            | ScanError::CircuitOpen { .. } => true,
            ScanError::Project { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            ScanError::Cancelled => true,
            ScanError::Project { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ScanError::Decode(err.to_string())
        } else {
            ScanError::Transport(err.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for ScanError {
    fn from(err: tokio::task::JoinError) -> Self {
        ScanError::Task(err.to_string())
    }
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
