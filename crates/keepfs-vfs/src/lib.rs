//! Collection filesystem for keepfs.
//!
//! A collection is a directory tree whose file content lives in immutable
//! blocks in a [`BlockStore`](keepfs_cas::BlockStore). The whole tree is
//! described by one manifest text; this crate loads a manifest into a
//! mutable in-memory tree, lets callers read and write it through
//! ordinary filesystem operations, and serializes it back.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ CollectionFs  (open_file, mkdir, rename, sync) │
//! ├────────────────────────────────────────────────┤
//! │ node tree     Dir │ File │ Generated │ Deferred │
//! ├────────────────────────────────────────────────┤
//! │ file engine   segments: memory │ stored        │
//! ├────────────────────────────────────────────────┤
//! │ flush         pack memory segments into blocks │
//! ├────────────────────────────────────────────────┤
//! │ BlockStore    read_at │ write_block            │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Writes land in memory segments. Full blocks are committed eagerly;
//! the rest waits for `flush`, `marshal_manifest` or `sync`.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use keepfs_cas::MemoryBlockStore;
//! use keepfs_vfs::{CollectionFs, FsConfig};
//!
//! let fs = CollectionFs::new(Arc::new(MemoryBlockStore::new()), FsConfig::default());
//! fs.write_file("foo", b"foo").unwrap();
//! assert_eq!(
//!     fs.marshal_manifest(".").unwrap(),
//!     ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:foo\n"
//! );
//! ```

mod client;
mod config;
mod error;
mod file;
mod flush;
mod fs;
mod handle;
pub mod manifest;
mod node;
mod rename;
mod segment;
mod snapshot;
mod types;

pub use client::{ClientError, CollectionClient, ManifestUpdate, MemoryCollectionClient};
pub use config::{FsConfig, DEFAULT_MAX_BLOCK_SIZE};
pub use error::{ErrorKind, VfsError, VfsResult};
pub use fs::CollectionFs;
pub use handle::FileHandle;
pub use node::COLLECTION_META_FILE;
pub use snapshot::Subtree;
pub use std::io::SeekFrom;
pub use types::{FileInfo, FileType, OpenFlags};
