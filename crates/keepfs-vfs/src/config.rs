//! Filesystem configuration.
//!
//! Loaded from TOML or built in code:
//!
//! ```toml
//! max_block_size = 67108864
//! file_perm = 0o644
//! dir_perm = 0o755
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VfsError, VfsResult};

/// Default upper bound on stored block size (64 MiB).
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 64 << 20;

const DEFAULT_FILE_PERM: u32 = 0o644;
const DEFAULT_DIR_PERM: u32 = 0o755;

/// Per-filesystem tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Largest block the filesystem will pack and write.
    pub max_block_size: usize,
    /// Permission bits for files created without an explicit mode.
    pub file_perm: u32,
    /// Permission bits for directories created without an explicit mode.
    pub dir_perm: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            file_perm: DEFAULT_FILE_PERM,
            dir_perm: DEFAULT_DIR_PERM,
        }
    }
}

impl FsConfig {
    /// Set the maximum block size.
    pub fn with_max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    /// Parse and validate TOML config text.
    pub fn from_toml_str(text: &str) -> VfsResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| VfsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> VfsResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VfsError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> VfsResult<()> {
        if self.max_block_size == 0 {
            return Err(VfsError::Config("max_block_size must be positive".into()));
        }
        if self.file_perm & !0o7777 != 0 || self.dir_perm & !0o7777 != 0 {
            return Err(VfsError::Config("permission bits out of range".into()));
        }
        Ok(())
    }
}
