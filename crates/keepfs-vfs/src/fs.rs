//! The collection filesystem.
//!
//! [`CollectionFs`] is a cheap handle around one tree. Paths are relative
//! to the collection root and walked component by component: empty and
//! `.` components are skipped and `..` moves up, stopping at the root.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use keepfs_cas::{portable_data_hash, BlockStore};
use serde::Serialize;
use tracing::{debug, info};

use crate::client::CollectionClient;
use crate::config::FsConfig;
use crate::error::{ErrorKind, VfsError, VfsResult};
use crate::file::FileState;
use crate::flush::flush_dir;
use crate::handle::FileHandle;
use crate::manifest;
use crate::node::{
    lookup, replace_child, FsCore, Node, NodeKind, NodeRef, COLLECTION_META_FILE, MOUNT_LOCK,
};
use crate::rename;
use crate::snapshot::{self, Subtree};
use crate::types::{FileInfo, OpenFlags};

/// Where `sync` persists manifests, and what it last persisted.
#[derive(Default)]
pub(crate) struct SyncState {
    pub(crate) uuid: Option<String>,
    pub(crate) client: Option<Arc<dyn CollectionClient>>,
    pub(crate) saved_pdh: Option<String>,
}

/// Content of the generated `.arvados#collection` file.
#[derive(Serialize)]
struct CollectionRecord {
    manifest_text: String,
    uuid: String,
}

/// The read-only metadata file at the root of `root`'s tree.
pub(crate) fn collection_meta_node(root: &NodeRef) -> NodeRef {
    let weak: Weak<Node> = Arc::downgrade(root);
    let node = Node::new_generated(
        root.core(),
        Box::new(move || {
            let root = weak
                .upgrade()
                .ok_or_else(|| VfsError::not_found(COLLECTION_META_FILE))?;
            let lock = root
                .dir()
                .ok_or_else(|| VfsError::not_a_directory("."))?;
            let manifest_text = manifest::marshal_dir(&root, &lock.read(), ".")?;
            let uuid = root.core().sync.lock().uuid.clone().unwrap_or_default();
            let mut out = serde_json::to_vec(&CollectionRecord {
                manifest_text,
                uuid,
            })
            .map_err(|e| VfsError::invalid_operation(e.to_string()))?;
            out.push(b'\n');
            Ok(out)
        }),
    );
    node.set_link(root, COLLECTION_META_FILE);
    node
}

/// Split after the last slash: `"a/b/c"` gives `("a/b/", "c")`.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Walk `path` from `start`.
pub(crate) fn rlookup(start: &NodeRef, path: &str) -> VfsResult<NodeRef> {
    let mut node = Arc::clone(start);
    for name in path.split('/') {
        if node.is_dir() {
            if name.is_empty() || name == "." {
                continue;
            }
            if name == ".." {
                node = node.parent();
                continue;
            }
        }
        let dir = node.resolve()?;
        let Some(lock) = dir.dir() else {
            return Err(VfsError::not_a_directory(path));
        };
        let next = lookup(&dir, &lock.read(), name)?;
        node = next.ok_or_else(|| VfsError::not_found(path))?;
    }
    Ok(node)
}

/// Walk to a directory and load it if deferred.
pub(crate) fn open_dir(start: &NodeRef, path: &str) -> VfsResult<NodeRef> {
    let node = rlookup(start, path)?.resolve()?;
    if node.dir().is_none() {
        return Err(VfsError::not_a_directory(path));
    }
    Ok(node)
}

/// A collection: a tree of directories and files whose content lives in
/// a block store.
#[derive(Clone)]
pub struct CollectionFs {
    core: Arc<FsCore>,
    root: NodeRef,
}

impl fmt::Debug for CollectionFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionFs")
            .field("id", &self.core.id)
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

impl CollectionFs {
    /// An empty collection.
    pub fn new(store: Arc<dyn BlockStore>, config: FsConfig) -> Self {
        let core = FsCore::new(store, config);
        let root = Node::new_root(&core, SystemTime::now());
        Self { core, root }
    }

    /// A collection populated from manifest text.
    pub fn from_manifest(
        text: &str,
        store: Arc<dyn BlockStore>,
        config: FsConfig,
    ) -> VfsResult<Self> {
        let fs = Self::new(store, config);
        manifest::load(&fs.root, text)?;
        fs.core.sync.lock().saved_pdh = Some(portable_data_hash(text));
        Ok(fs)
    }

    /// Attach the collection identifier and client used by [`sync`].
    ///
    /// [`sync`]: CollectionFs::sync
    pub fn with_client(self, uuid: impl Into<String>, client: Arc<dyn CollectionClient>) -> Self {
        {
            let mut sync = self.core.sync.lock();
            sync.uuid = Some(uuid.into());
            sync.client = Some(client);
        }
        self
    }

    pub(crate) fn root_node(&self) -> &NodeRef {
        &self.root
    }

    pub fn config(&self) -> &FsConfig {
        &self.core.config
    }

    /// Collection identifier, if a client is attached.
    pub fn uuid(&self) -> Option<String> {
        self.core.sync.lock().uuid.clone()
    }

    /// Open or create the node at `path`.
    ///
    /// `perm` applies to a newly created node; zero picks the configured
    /// default for its kind.
    pub fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> VfsResult<FileHandle> {
        let node = self.open_node(path, flags, perm)?;
        Ok(FileHandle::new(node, flags))
    }

    /// Open for reading.
    pub fn open(&self, path: &str) -> VfsResult<FileHandle> {
        self.open_file(path, OpenFlags::read(), 0)
    }

    /// Open for reading and writing, creating or truncating.
    pub fn create(&self, path: &str) -> VfsResult<FileHandle> {
        self.open_file(path, OpenFlags::create_truncate(), 0)
    }

    fn open_node(&self, path: &str, flags: OpenFlags, perm: u32) -> VfsResult<NodeRef> {
        if flags.sync {
            return Err(VfsError::SyncNotSupported);
        }
        if !flags.read && !flags.write {
            return Err(VfsError::invalid_argument(
                "open flags grant neither read nor write access",
            ));
        }
        let (dir_path, name) = split_path(path);
        let parent = open_dir(&self.root, dir_path)?;
        let Some(lock) = parent.dir() else {
            return Err(VfsError::not_a_directory(dir_path));
        };

        let (node, created) = match name {
            "" | "." => (Arc::clone(&parent), false),
            ".." => (parent.parent(), false),
            _ if flags.create => {
                let mut state = lock.write();
                match lookup(&parent, &state, name)? {
                    Some(_) if flags.exclusive => return Err(VfsError::already_exists(path)),
                    Some(node) => (node, false),
                    None => {
                        let core = parent.core();
                        let now = SystemTime::now();
                        let node = if flags.directory {
                            let perm = if perm == 0 { core.config.dir_perm } else { perm };
                            Node::new_dir(core, perm, now)
                        } else {
                            let perm = if perm == 0 { core.config.file_perm } else { perm };
                            Node::new_file(core, FileState::new(perm, now))
                        };
                        replace_child(&parent, &mut state, name, |_| Ok(Some(Arc::clone(&node))))?;
                        debug!(path, dir = flags.directory, "created");
                        (node, true)
                    }
                }
            }
            _ => {
                let found = lookup(&parent, &lock.read(), name)?;
                (found.ok_or_else(|| VfsError::not_found(path))?, false)
            }
        };

        if flags.truncate && !created {
            if !flags.write {
                return Err(VfsError::invalid_argument(
                    "truncate requires write access",
                ));
            }
            if node.is_dir() {
                return Err(VfsError::invalid_argument(format!(
                    "cannot truncate directory {path:?}"
                )));
            }
            let Some(file) = node.file() else {
                return Err(VfsError::invalid_operation(format!(
                    "{path:?} is read-only"
                )));
            };
            file.write().truncate(0, node.core().max_block_size());
        }
        Ok(node)
    }

    /// Create a directory. The parent must exist.
    pub fn mkdir(&self, path: &str, perm: u32) -> VfsResult<()> {
        let path = path.trim_end_matches('/');
        let (dir_path, name) = split_path(path);
        let parent = open_dir(&self.root, dir_path)?;
        let Some(lock) = parent.dir() else {
            return Err(VfsError::not_a_directory(dir_path));
        };
        let mut state = lock.write();
        if lookup(&parent, &state, name)?.is_some() {
            return Err(VfsError::already_exists(path));
        }
        let core = parent.core();
        let perm = if perm == 0 { core.config.dir_perm } else { perm };
        replace_child(&parent, &mut state, name, |_| {
            Ok(Some(Node::new_dir(core, perm, SystemTime::now())))
        })?;
        debug!(path, "mkdir");
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub fn remove(&self, path: &str) -> VfsResult<()> {
        self.remove_node(path, false)
    }

    /// Remove a file or directory and everything under it. A missing
    /// path is not an error.
    pub fn remove_all(&self, path: &str) -> VfsResult<()> {
        match self.remove_node(path, true) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn remove_node(&self, path: &str, recursive: bool) -> VfsResult<()> {
        let trimmed = path.trim_end_matches('/');
        let (dir_path, name) = split_path(trimmed);
        if matches!(name, "" | "." | "..") {
            return Err(VfsError::invalid_argument(format!("cannot remove {path:?}")));
        }
        let dir = open_dir(&self.root, dir_path)?;
        let Some(lock) = dir.dir() else {
            return Err(VfsError::not_a_directory(dir_path));
        };
        if !recursive {
            // A mount point is only empty if the tree behind it is.
            let existing = lookup(&dir, &lock.read(), name)?;
            if let Some(node) = existing {
                if matches!(node.kind(), NodeKind::Deferred(_)) {
                    node.resolve()?;
                }
            }
        }
        replace_child(&dir, &mut lock.write(), name, |existing| {
            let Some(node) = existing else {
                return Err(VfsError::not_found(path));
            };
            if !recursive && node.is_dir() && node.info()?.size > 0 {
                return Err(VfsError::directory_not_empty(path));
            }
            Ok(None)
        })?;
        debug!(path, recursive, "removed");
        Ok(())
    }

    /// Move the node at `old` to `new`, replacing a file at `new`.
    pub fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        rename::rename(&self.root, old, new)?;
        debug!(old, new, "renamed");
        Ok(())
    }

    /// Metadata for the node at `path`.
    pub fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        self.open_node(path, OpenFlags::read(), 0)?.info()
    }

    /// All entries of the directory at `path`.
    pub fn read_dir(&self, path: &str) -> VfsResult<Vec<FileInfo>> {
        self.open(path)?.readdir(0)
    }

    /// Whole content of the file at `path`.
    pub fn read_file(&self, path: &str) -> VfsResult<Vec<u8>> {
        let mut handle = self.open(path)?;
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 << 10];
        loop {
            let n = handle.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Replace the content of the file at `path`, creating it if needed.
    pub fn write_file(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let mut handle = self.create(path)?;
        let mut rest = data;
        while !rest.is_empty() {
            let n = handle.write(rest)?;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Manifest text for the whole tree, using `prefix` as the root
    /// stream name (normally `"."`). Flushes every file first.
    pub fn marshal_manifest(&self, prefix: &str) -> VfsResult<String> {
        let Some(lock) = self.root.dir() else {
            return Err(VfsError::not_a_directory(prefix));
        };
        let text = manifest::marshal_dir(&self.root, &lock.read(), prefix)?;
        debug!(len = text.len(), "marshaled manifest");
        Ok(text)
    }

    /// Commit memory segments to the block store.
    ///
    /// An empty `path` flushes the whole tree; a directory path flushes
    /// only that directory's files. Without `short_blocks` a trailing
    /// partial block stays in memory.
    pub fn flush(&self, path: &str, short_blocks: bool) -> VfsResult<()> {
        let (dir, recursive) = if path.is_empty() {
            (Arc::clone(&self.root), true)
        } else {
            (open_dir(&self.root, path)?, false)
        };
        let Some(lock) = dir.dir() else {
            return Err(VfsError::not_a_directory(path));
        };
        let core = dir.core();
        flush_dir(
            &lock.read(),
            core.id,
            core.store.as_ref(),
            core.max_block_size(),
            recursive,
            short_blocks,
        )
    }

    /// Flush everything and persist the manifest through the attached
    /// client, unless it is unchanged since the last persist.
    pub fn sync(&self) -> VfsResult<()> {
        let text = self.marshal_manifest(".")?;
        let mut sync = self.core.sync.lock();
        let (Some(uuid), Some(client)) = (sync.uuid.clone(), sync.client.clone()) else {
            debug!("no collection client attached, flushed only");
            return Ok(());
        };
        let pdh = portable_data_hash(&text);
        if sync.saved_pdh.as_deref() == Some(pdh.as_str()) {
            debug!(%uuid, %pdh, "manifest unchanged, skipping update");
            return Ok(());
        }
        let recorded = client.update_manifest(&uuid, &text)?;
        info!(%uuid, pdh = %recorded, len = text.len(), "synced collection");
        sync.saved_pdh = Some(recorded);
        Ok(())
    }

    /// Total bytes of every file in the tree.
    pub fn size(&self) -> u64 {
        self.root.tree_size()
    }

    /// Approximate bytes held in memory by the tree.
    pub fn memory_size(&self) -> usize {
        self.root.memory_size()
    }

    /// Attach the root of `other` at `path`.
    ///
    /// `other` keeps its own root: `..` at that root still stays inside
    /// `other`. Mounting a tree into itself, or into a tree it already
    /// contains, is invalid-argument.
    pub fn mount(&self, path: &str, other: &CollectionFs) -> VfsResult<()> {
        let target = Arc::clone(&other.root);
        self.attach(path, move |core| {
            if target.reaches_tree(core.id) {
                return Err(VfsError::invalid_argument(format!(
                    "cannot mount a tree inside itself at {path:?}"
                )));
            }
            Ok(Node::new_mount(core, target))
        })
    }

    /// Attach a directory at `path` whose content is built by `loader`
    /// on first use.
    pub fn mount_deferred<F>(&self, path: &str, loader: F) -> VfsResult<()>
    where
        F: Fn() -> VfsResult<CollectionFs> + Send + Sync + 'static,
    {
        self.attach(path, move |core| {
            Ok(Node::new_deferred(
                core,
                Box::new(move || Ok(Arc::clone(&loader()?.root))),
            ))
        })
    }

    fn attach(
        &self,
        path: &str,
        make: impl FnOnce(&Arc<FsCore>) -> VfsResult<NodeRef>,
    ) -> VfsResult<()> {
        let path = path.trim_end_matches('/');
        let (dir_path, name) = split_path(path);
        let parent = open_dir(&self.root, dir_path)?;
        let Some(lock) = parent.dir() else {
            return Err(VfsError::not_a_directory(dir_path));
        };
        // Taken after the walk, which may load deferred nodes, and before
        // any directory lock.
        let _mounts = MOUNT_LOCK.lock();
        let mut state = lock.write();
        if lookup(&parent, &state, name)?.is_some() {
            return Err(VfsError::already_exists(path));
        }
        let node = make(parent.core())?;
        replace_child(&parent, &mut state, name, |_| Ok(Some(node)))?;
        debug!(path, "mounted");
        Ok(())
    }

    /// Detached copy of the subtree at `path`.
    pub fn snapshot(&self, path: &str) -> VfsResult<Subtree> {
        let node = rlookup(&self.root, path)?;
        snapshot::snapshot(&node)
    }

    /// Replace the node at `path` with a copy of `subtree`, creating a
    /// file there first if nothing exists.
    pub fn splice(&self, path: &str, subtree: &Subtree) -> VfsResult<()> {
        let node = match self.open_node(path, OpenFlags::read(), 0) {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.open_node(path, OpenFlags::create(), 0)?
            }
            other => other?,
        };
        snapshot::splice(&node, subtree)?;
        debug!(path, "spliced");
        Ok(())
    }
}
