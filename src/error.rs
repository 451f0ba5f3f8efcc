//! Error taxonomy for the analysis pipeline.
//!
//! [`PipelineError`] covers everything the processor can surface for a run or
//! a single file. [`BackendError`] is what an
//! [`AnalysisBackend`](crate::backend::AnalysisBackend) returns; its
//! classification decides whether the processor retries the call.

use thiserror::Error;

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors produced by the pipeline.
///
/// Only [`PipelineError::Configuration`] aborts a run. Every other variant is
/// contained to the file (or unit) it happened on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Invalid chunking or pipeline parameters. Fatal, raised before any file
    /// is processed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A backend call kept failing transiently until retries ran out.
    #[error("backend '{backend}' failed after {attempts} attempts: {message}")]
    BackendTransient {
        backend: String,
        attempts: u32,
        message: String,
    },

    /// A backend call failed in a way retrying cannot fix.
    #[error("backend '{backend}' rejected the task: {message}")]
    BackendPermanent { backend: String, message: String },

    /// The cache could not be read or written for a file.
    #[error("cache I/O error: {0}")]
    CacheIo(String),

    /// The file content could not be read or decoded.
    #[error("cannot fingerprint {path}: {message}")]
    Fingerprint { path: String, message: String },
}

impl PipelineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn cache_io(msg: impl Into<String>) -> Self {
        Self::CacheIo(msg.into())
    }

    pub fn fingerprint(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fingerprint {
            path: path.into(),
            message: msg.into(),
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::CacheIo(err.to_string())
    }
}

/// Failure reported by a backend for one call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Timeout, rate limit, connection reset. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid input or a malformed response. Not retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The backend does not handle this task kind. Not retried.
    #[error("unsupported task kind: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Lift this failure into the pipeline taxonomy after `attempts` tries.
    pub fn into_pipeline(self, backend: &str, attempts: u32) -> PipelineError {
        match self {
            Self::Transient(message) => PipelineError::BackendTransient {
                backend: backend.to_string(),
                attempts,
                message,
            },
            Self::Permanent(message) => PipelineError::BackendPermanent {
                backend: backend.to_string(),
                message,
            },
            Self::Unsupported(kind) => PipelineError::BackendPermanent {
                backend: backend.to_string(),
                message: format!("unsupported task kind: {}", kind),
            },
        }
    }
}
