//! The inode tree.
//!
//! Nodes are owned top-down through directory child maps. Each node holds
//! a weak reference to its parent; the root's parent reference points at
//! the root itself, which is the terminal case when walking upward.
//!
//! Every node kind carries its own lock. Directory mutation takes the
//! directory's write lock and lookups take its read lock. When several
//! locks are needed they are always taken parent before child; rename
//! follows the protocol in `rename.rs`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

use keepfs_cas::BlockStore;
use parking_lot::{Mutex, RwLock};

use crate::config::FsConfig;
use crate::error::{VfsError, VfsResult};
use crate::file::FileState;
use crate::fs::SyncState;
use crate::types::{FileInfo, FileType};

pub(crate) type NodeRef = Arc<Node>;

/// Name of the read-only virtual file at the root of every collection.
pub const COLLECTION_META_FILE: &str = ".arvados#collection";

static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every node of one collection tree.
pub(crate) struct FsCore {
    pub(crate) id: u64,
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) config: FsConfig,
    /// Whole-tree lock taken before any multi-directory locking.
    pub(crate) rename_lock: Mutex<()>,
    pub(crate) root: OnceLock<Weak<Node>>,
    pub(crate) sync: Mutex<SyncState>,
}

impl FsCore {
    pub(crate) fn new(store: Arc<dyn BlockStore>, config: FsConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FS_ID.fetch_add(1, Ordering::Relaxed),
            store,
            config,
            rename_lock: Mutex::new(()),
            root: OnceLock::new(),
            sync: Mutex::new(SyncState::default()),
        })
    }

    pub(crate) fn max_block_size(&self) -> usize {
        self.config.max_block_size
    }
}

struct Link {
    parent: Weak<Node>,
    name: String,
}

pub(crate) struct Node {
    core: Arc<FsCore>,
    link: Mutex<Link>,
    kind: NodeKind,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.link.lock().name)
            .finish_non_exhaustive()
    }
}

pub(crate) enum NodeKind {
    Dir(RwLock<DirState>),
    File(RwLock<FileState>),
    Generated(GeneratedNode),
    Deferred(DeferredNode),
}

/// Lock-protected state of a directory node.
pub(crate) struct DirState {
    /// Children by name; iteration order is the serialization order.
    pub(crate) children: BTreeMap<String, NodeRef>,
    pub(crate) perm: u32,
    pub(crate) mtime: SystemTime,
}

impl DirState {
    pub(crate) fn new(perm: u32, mtime: SystemTime) -> Self {
        Self {
            children: BTreeMap::new(),
            perm,
            mtime,
        }
    }
}

pub(crate) type Getter = Box<dyn Fn() -> VfsResult<Vec<u8>> + Send + Sync>;

/// Read-only content computed on first use.
pub(crate) struct GeneratedNode {
    getter: Getter,
    cache: Mutex<Option<Arc<[u8]>>>,
    mtime: SystemTime,
}

impl GeneratedNode {
    /// The content, computing and caching it on first call.
    pub(crate) fn content(&self) -> VfsResult<Arc<[u8]>> {
        let mut cache = self.cache.lock();
        if let Some(data) = cache.as_ref() {
            return Ok(Arc::clone(data));
        }
        let data: Arc<[u8]> = (self.getter)()?.into();
        *cache = Some(Arc::clone(&data));
        Ok(data)
    }
}

pub(crate) type Loader = Box<dyn Fn() -> VfsResult<NodeRef> + Send + Sync>;

/// Serializes every change to which trees are mounted inside which, so
/// the cycle check and the attach it guards cannot interleave.
pub(crate) static MOUNT_LOCK: Mutex<()> = Mutex::new(());

/// A directory entry standing in for the root of another tree.
///
/// The real node is either given up front (a mount) or built by the
/// loader on first use. It is never relinked: the other tree's root stays
/// its own parent, and this node carries the name and parent on the host
/// side. Until loaded, metadata comes from an empty placeholder
/// directory. The loader mutex serializes loading; a failed load is
/// retried next time.
pub(crate) struct DeferredNode {
    placeholder: NodeRef,
    loader: Mutex<Option<Loader>>,
    real: OnceLock<NodeRef>,
}

impl DeferredNode {
    fn current(&self) -> &NodeRef {
        self.real.get().unwrap_or(&self.placeholder)
    }

    fn real(&self, owner: &NodeRef) -> VfsResult<NodeRef> {
        if let Some(node) = self.real.get() {
            return Ok(Arc::clone(node));
        }
        let loader = self.loader.lock();
        if let Some(node) = self.real.get() {
            return Ok(Arc::clone(node));
        }
        let Some(load) = loader.as_ref() else {
            return Err(VfsError::invalid_operation(format!(
                "{:?} has nothing to load",
                owner.name()
            )));
        };
        let node = load()?;
        let _mounts = MOUNT_LOCK.lock();
        if node.reaches_tree(owner.fs_id()) {
            return Err(VfsError::invalid_argument(format!(
                "loading {:?} would mount a tree inside itself",
                owner.name()
            )));
        }
        tracing::debug!(name = %owner.name(), "loaded deferred node");
        Ok(Arc::clone(self.real.get_or_init(|| node)))
    }
}

impl Node {
    fn with_kind(core: &Arc<FsCore>, kind: NodeKind) -> NodeRef {
        Arc::new(Node {
            core: Arc::clone(core),
            link: Mutex::new(Link {
                parent: Weak::new(),
                name: String::new(),
            }),
            kind,
        })
    }

    /// Create the root directory of `core`. Its parent is itself.
    pub(crate) fn new_root(core: &Arc<FsCore>, mtime: SystemTime) -> NodeRef {
        let root = Arc::new_cyclic(|me| Node {
            core: Arc::clone(core),
            link: Mutex::new(Link {
                parent: me.clone(),
                name: ".".to_owned(),
            }),
            kind: NodeKind::Dir(RwLock::new(DirState::new(core.config.dir_perm, mtime))),
        });
        let _ = core.root.set(Arc::downgrade(&root));
        root
    }

    /// Create a detached directory; `replace_child` attaches it.
    pub(crate) fn new_dir(core: &Arc<FsCore>, perm: u32, mtime: SystemTime) -> NodeRef {
        Self::with_kind(core, NodeKind::Dir(RwLock::new(DirState::new(perm, mtime))))
    }

    pub(crate) fn new_file(core: &Arc<FsCore>, state: FileState) -> NodeRef {
        Self::with_kind(core, NodeKind::File(RwLock::new(state)))
    }

    pub(crate) fn new_generated(core: &Arc<FsCore>, getter: Getter) -> NodeRef {
        Self::with_kind(
            core,
            NodeKind::Generated(GeneratedNode {
                getter,
                cache: Mutex::new(None),
                mtime: SystemTime::now(),
            }),
        )
    }

    pub(crate) fn new_deferred(core: &Arc<FsCore>, loader: Loader) -> NodeRef {
        let placeholder = Self::new_dir(core, core.config.dir_perm, SystemTime::now());
        Self::with_kind(
            core,
            NodeKind::Deferred(DeferredNode {
                placeholder,
                loader: Mutex::new(Some(loader)),
                real: OnceLock::new(),
            }),
        )
    }

    /// Create a mount point for `target`, the root of another tree.
    pub(crate) fn new_mount(core: &Arc<FsCore>, target: NodeRef) -> NodeRef {
        let placeholder = Self::new_dir(core, core.config.dir_perm, SystemTime::now());
        Self::with_kind(
            core,
            NodeKind::Deferred(DeferredNode {
                placeholder,
                loader: Mutex::new(None),
                real: OnceLock::from(target),
            }),
        )
    }

    pub(crate) fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub(crate) fn core(&self) -> &Arc<FsCore> {
        &self.core
    }

    /// Identity of the tree this node belongs to.
    pub(crate) fn fs_id(&self) -> u64 {
        self.core.id
    }

    pub(crate) fn name(&self) -> String {
        self.link.lock().name.clone()
    }

    /// Parent directory; the root (or a detached node) is its own parent.
    pub(crate) fn parent(self: &Arc<Self>) -> NodeRef {
        self.link
            .lock()
            .parent
            .upgrade()
            .unwrap_or_else(|| Arc::clone(self))
    }

    pub(crate) fn set_link(&self, parent: &NodeRef, name: &str) {
        let mut link = self.link.lock();
        link.parent = Arc::downgrade(parent);
        link.name = name.to_owned();
    }

    /// True for the root of this node's own tree.
    pub(crate) fn is_root(&self) -> bool {
        self.core
            .root
            .get()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), self))
    }

    pub(crate) fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_) | NodeKind::Deferred(_))
    }

    /// Mount points: deferred nodes and roots of other trees.
    pub(crate) fn is_mount_point(&self, fs_id: u64) -> bool {
        self.core.id != fs_id || matches!(self.kind, NodeKind::Deferred(_))
    }

    pub(crate) fn dir(&self) -> Option<&RwLock<DirState>> {
        match &self.kind {
            NodeKind::Dir(lock) => Some(lock),
            _ => None,
        }
    }

    pub(crate) fn file(&self) -> Option<&RwLock<FileState>> {
        match &self.kind {
            NodeKind::File(lock) => Some(lock),
            _ => None,
        }
    }

    /// The node that does the work: deferred nodes are loaded and
    /// replaced by their real node, everything else is itself.
    pub(crate) fn resolve(self: &Arc<Self>) -> VfsResult<NodeRef> {
        match &self.kind {
            NodeKind::Deferred(d) => d.real(self),
            _ => Ok(Arc::clone(self)),
        }
    }

    /// Metadata without forcing a deferred node to load.
    pub(crate) fn info(self: &Arc<Self>) -> VfsResult<FileInfo> {
        let name = self.name();
        Ok(match &self.kind {
            NodeKind::Dir(lock) => {
                let dir = lock.read();
                FileInfo {
                    name,
                    kind: FileType::Directory,
                    size: dir.children.len() as u64,
                    perm: dir.perm,
                    mtime: dir.mtime,
                }
            }
            NodeKind::File(lock) => {
                let file = lock.read();
                FileInfo {
                    name,
                    kind: FileType::File,
                    size: file.size() as u64,
                    perm: file.perm,
                    mtime: file.mtime,
                }
            }
            NodeKind::Generated(g) => FileInfo {
                name,
                kind: FileType::File,
                size: g.content()?.len() as u64,
                perm: 0o444,
                mtime: g.mtime,
            },
            NodeKind::Deferred(d) => FileInfo {
                name,
                ..d.current().info()?
            },
        })
    }

    /// True if the tree `fs_id` is this node's own tree or is mounted
    /// somewhere below it. Unloaded deferred nodes are not followed.
    pub(crate) fn reaches_tree(&self, fs_id: u64) -> bool {
        if self.core.id == fs_id {
            return true;
        }
        match &self.kind {
            NodeKind::Dir(lock) => {
                let children: Vec<NodeRef> = lock.read().children.values().cloned().collect();
                children.iter().any(|c| c.reaches_tree(fs_id))
            }
            NodeKind::Deferred(d) => d.real.get().is_some_and(|n| n.reaches_tree(fs_id)),
            NodeKind::File(_) | NodeKind::Generated(_) => false,
        }
    }

    /// Bytes held in memory by this subtree, approximately.
    pub(crate) fn memory_size(&self) -> usize {
        match &self.kind {
            NodeKind::Dir(lock) => {
                let children: Vec<NodeRef> = lock.read().children.values().cloned().collect();
                64 + children.iter().map(|c| c.memory_size()).sum::<usize>()
            }
            NodeKind::File(lock) => lock.read().memory_size(),
            NodeKind::Generated(g) => 64 + g.cache.lock().as_ref().map_or(0, |d| d.len()),
            NodeKind::Deferred(d) => 64 + d.current().memory_size(),
        }
    }

    /// Total file bytes in this subtree. Unloaded deferred nodes count
    /// as empty.
    pub(crate) fn tree_size(&self) -> u64 {
        match &self.kind {
            NodeKind::Dir(lock) => {
                let children: Vec<NodeRef> = lock.read().children.values().cloned().collect();
                children.iter().map(|c| c.tree_size()).sum()
            }
            NodeKind::File(lock) => lock.read().size() as u64,
            NodeKind::Generated(_) => 0,
            NodeKind::Deferred(d) => d.current().tree_size(),
        }
    }
}

/// Reject names that cannot be directory entries.
pub(crate) fn check_name(name: &str) -> VfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(VfsError::invalid_argument(format!("invalid name {name:?}")));
    }
    Ok(())
}

/// Look up `name` in `dir`. The caller holds `dir`'s read or write lock.
///
/// This is the replacer-less form of [`replace_child`].
pub(crate) fn lookup(dir: &NodeRef, state: &DirState, name: &str) -> VfsResult<Option<NodeRef>> {
    check_name(name)?;
    if name == COLLECTION_META_FILE && dir.is_root() {
        return Ok(Some(crate::fs::collection_meta_node(dir)));
    }
    Ok(state.children.get(name).cloned())
}

/// Look up `name` in `dir` and hand the result to `replace`; install what
/// it returns, or remove the entry when it returns `None`. The caller
/// holds `dir`'s write lock.
///
/// An error from `replace` leaves the directory unchanged.
pub(crate) fn replace_child<F>(
    dir: &NodeRef,
    state: &mut DirState,
    name: &str,
    replace: F,
) -> VfsResult<Option<NodeRef>>
where
    F: FnOnce(Option<NodeRef>) -> VfsResult<Option<NodeRef>>,
{
    check_name(name)?;
    if name == COLLECTION_META_FILE && dir.is_root() {
        return Err(VfsError::invalid_operation(format!(
            "{COLLECTION_META_FILE} is read-only"
        )));
    }
    let existing = state.children.get(name).cloned();
    let had_existing = existing.is_some();
    let prev_ptr = existing.as_ref().map(Arc::as_ptr);
    match replace(existing)? {
        None => {
            if had_existing {
                state.children.remove(name);
                state.mtime = SystemTime::now();
            }
            Ok(None)
        }
        Some(node) => {
            if prev_ptr != Some(Arc::as_ptr(&node)) {
                node.set_link(dir, name);
                state.children.insert(name.to_owned(), Arc::clone(&node));
                state.mtime = SystemTime::now();
            }
            Ok(Some(node))
        }
    }
}
