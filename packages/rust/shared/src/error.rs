//! Error types for TenderFlow.
//!
//! Library crates use [`TenderFlowError`] via `thiserror`.
//! The CLI app wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all TenderFlow operations.
#[derive(Debug, thiserror::Error)]
pub enum TenderFlowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error. Fatal for the stage that hit it:
    /// the stage must not commit and the tender status must not advance.
    #[error("storage error: {0}")]
    Storage(String),

    /// Oracle (generation endpoint) transport or protocol error.
    #[error("oracle error: {0}")]
    Oracle(String),

    /// Vector index error (not built, dimension mismatch, bad index file).
    #[error("index error: {0}")]
    Index(String),

    /// Structured-payload parsing error (oracle output, stored JSON).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown status, invalid identifier, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TenderFlowError>;

impl TenderFlowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
