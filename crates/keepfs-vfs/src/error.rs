//! Filesystem error types.

use std::io;

use keepfs_cas::CasError;
use strum::{AsRefStr, Display};
use thiserror::Error;

use crate::client::ClientError;

/// Filesystem error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Missing path component.
    #[error("not found: {0}")]
    NotFound(String),

    /// Exclusive create, or mkdir, hit an existing entry.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed name or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Action not supported by this kind of node.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Write through a handle not opened for writing.
    #[error("read-only file")]
    ReadOnlyFile,

    /// Read through a handle not opened for reading.
    #[error("file is write-only")]
    WriteOnlyMode,

    /// Non-recursive remove of a populated directory.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// A directory is in the way.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Position below zero.
    #[error("negative offset")]
    NegativeOffset,

    /// Synchronous-write open flag.
    #[error("synchronous writes are not supported")]
    SyncNotSupported,

    /// Malformed manifest text.
    #[error("line {line}: {message}")]
    ManifestParse { line: usize, message: String },

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Block store failure, passed through.
    #[error(transparent)]
    Store(#[from] CasError),

    /// Collection metadata client failure, passed through.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Error kind, for callers that map errors onto their own protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    InvalidOperation,
    ReadOnlyFile,
    WriteOnlyMode,
    DirectoryNotEmpty,
    IsADirectory,
    NotADirectory,
    NegativeOffset,
    SyncNotSupported,
    ManifestParse,
    Config,
    Storage,
    Client,
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an InvalidOperation error.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::ManifestParse {
            line,
            message: message.into(),
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Self::ReadOnlyFile => ErrorKind::ReadOnlyFile,
            Self::WriteOnlyMode => ErrorKind::WriteOnlyMode,
            Self::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            Self::IsADirectory(_) => ErrorKind::IsADirectory,
            Self::NotADirectory(_) => ErrorKind::NotADirectory,
            Self::NegativeOffset => ErrorKind::NegativeOffset,
            Self::SyncNotSupported => ErrorKind::SyncNotSupported,
            Self::ManifestParse { .. } => ErrorKind::ManifestParse,
            Self::Config(_) => ErrorKind::Config,
            Self::Store(_) => ErrorKind::Storage,
            Self::Client(_) => ErrorKind::Client,
        }
    }
}

/// Convert VfsError to std::io::Error for adaptors.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        let kind = match e.kind() {
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::InvalidArgument | ErrorKind::NegativeOffset | ErrorKind::Config => {
                io::ErrorKind::InvalidInput
            }
            ErrorKind::ReadOnlyFile | ErrorKind::WriteOnlyMode => io::ErrorKind::PermissionDenied,
            ErrorKind::DirectoryNotEmpty => io::ErrorKind::DirectoryNotEmpty,
            ErrorKind::IsADirectory => io::ErrorKind::IsADirectory,
            ErrorKind::NotADirectory => io::ErrorKind::NotADirectory,
            ErrorKind::SyncNotSupported => io::ErrorKind::Unsupported,
            ErrorKind::ManifestParse => io::ErrorKind::InvalidData,
            ErrorKind::InvalidOperation | ErrorKind::Storage | ErrorKind::Client => {
                io::ErrorKind::Other
            }
        };
        match e {
            VfsError::Store(CasError::Io(inner)) => inner,
            other => io::Error::new(kind, other),
        }
    }
}

/// Filesystem result type.
pub type VfsResult<T> = Result<T, VfsError>;
