//! Core filesystem types.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file (including generated read-only files).
    File,
    /// Directory.
    Directory,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Metadata for one node, as returned by `stat` and `readdir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry name (not full path). The root directory is named ".".
    pub name: String,
    /// File type.
    pub kind: FileType,
    /// Size in bytes for files; number of entries for directories.
    pub size: u64,
    /// Unix permission bits (e.g., 0o644).
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
}

impl FileInfo {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Open flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Every write goes to the current end of file.
    pub append: bool,
    /// Create if the entry doesn't exist.
    pub create: bool,
    /// Truncate to zero length on open.
    pub truncate: bool,
    /// Fail if the entry exists (with create).
    pub exclusive: bool,
    /// Synchronous writes. Not supported; opening with this set fails.
    pub sync: bool,
    /// Create a directory instead of a file (with create).
    pub directory: bool,
}

impl OpenFlags {
    /// Read-only flags.
    pub fn read() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Write-only flags.
    pub fn write() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    /// Read-write flags.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Create flags (read-write, create if missing).
    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::read_write()
        }
    }

    /// Create exclusive flags (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::create()
        }
    }

    /// Create and truncate flags.
    pub fn create_truncate() -> Self {
        Self {
            truncate: true,
            ..Self::create()
        }
    }

    /// Write-only append flags, creating the file if missing.
    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            create: true,
            ..Default::default()
        }
    }

    /// Add create-if-missing to these flags.
    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }

    pub fn with_append(mut self) -> Self {
        self.append = true;
        self
    }

    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn with_exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_sync(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Create a directory rather than a file when the entry is missing.
    pub fn as_directory(mut self) -> Self {
        self.directory = true;
        self
    }
}
