//! Content-addressed block storage for keepfs.
//!
//! Collections never own their bytes directly. File content lives in
//! immutable blocks identified by a [`Locator`] (md5 content hash plus
//! size), and the filesystem layer talks to storage through the two-call
//! [`BlockStore`] trait.
//!
//! Backends provided here:
//!
//! - [`MemoryBlockStore`] - process-local map, used by tests and tools
//! - [`DirBlockStore`] - one file per block under a local directory

mod dir;
mod error;
mod locator;
mod memory;
mod store;

pub use dir::DirBlockStore;
pub use error::{CasError, CasResult};
pub use locator::{portable_data_hash, Locator, EMPTY_BLOCK_LOCATOR};
pub use memory::MemoryBlockStore;
pub use store::{BlockStore, BlockWriteResponse};
