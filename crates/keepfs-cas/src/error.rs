//! Block store error types.

use std::io;
use thiserror::Error;

/// Errors surfaced by block storage backends.
#[derive(Debug, Error)]
pub enum CasError {
    /// No block stored under this locator.
    #[error("block not found: {0}")]
    NotFound(String),

    /// Text that does not parse as `hash+size[+hint...]`.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    /// Stored block shorter than its locator claims.
    #[error("short block {locator}: expected {expected} bytes, found {actual}")]
    ShortBlock {
        locator: String,
        expected: u64,
        actual: u64,
    },

    /// I/O error from a local backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Backend-specific failure, passed through verbatim.
    #[error("{0}")]
    Backend(String),
}

impl CasError {
    /// Create a NotFound error.
    pub fn not_found(locator: impl Into<String>) -> Self {
        Self::NotFound(locator.into())
    }

    /// Create an InvalidLocator error.
    pub fn invalid_locator(text: impl Into<String>) -> Self {
        Self::InvalidLocator(text.into())
    }

    /// Create a Backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Block store result type.
pub type CasResult<T> = Result<T, CasError>;
