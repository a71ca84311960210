//! Detached subtree copies.
//!
//! A [`Subtree`] shares stored segments with the tree it was taken from
//! (blocks are immutable) and owns copies of memory segments, so later
//! writes on either side do not show through.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{VfsError, VfsResult};
use crate::file::FileState;
use crate::node::{replace_child, FsCore, Node, NodeKind, NodeRef};
use crate::segment::Segment;

/// A point-in-time copy of a file or directory tree.
#[derive(Debug, Clone)]
pub struct Subtree {
    root: SubtreeNode,
}

#[derive(Debug, Clone)]
enum SubtreeNode {
    File {
        segments: Vec<Segment>,
        perm: u32,
        mtime: SystemTime,
    },
    Dir {
        children: BTreeMap<String, SubtreeNode>,
        perm: u32,
        mtime: SystemTime,
    },
}

impl SubtreeNode {
    fn size(&self) -> u64 {
        match self {
            SubtreeNode::File { segments, .. } => segments.iter().map(|s| s.len() as u64).sum(),
            SubtreeNode::Dir { children, .. } => children.values().map(SubtreeNode::size).sum(),
        }
    }
}

impl Subtree {
    pub fn is_dir(&self) -> bool {
        matches!(self.root, SubtreeNode::Dir { .. })
    }

    /// Total file bytes in the copy.
    pub fn size(&self) -> u64 {
        self.root.size()
    }
}

pub(crate) fn snapshot(node: &NodeRef) -> VfsResult<Subtree> {
    Ok(Subtree {
        root: copy_node(node)?,
    })
}

fn copy_node(node: &NodeRef) -> VfsResult<SubtreeNode> {
    let node = node.resolve()?;
    match node.kind() {
        NodeKind::File(lock) => {
            let file = lock.read();
            Ok(SubtreeNode::File {
                segments: file.segments.clone(),
                perm: file.perm,
                mtime: file.mtime,
            })
        }
        NodeKind::Dir(lock) => {
            let (entries, perm, mtime) = {
                let dir = lock.read();
                let entries: Vec<(String, NodeRef)> = dir
                    .children
                    .iter()
                    .map(|(name, child)| (name.clone(), Arc::clone(child)))
                    .collect();
                (entries, dir.perm, dir.mtime)
            };
            let mut children = BTreeMap::new();
            for (name, child) in entries {
                children.insert(name, copy_node(&child)?);
            }
            Ok(SubtreeNode::Dir {
                children,
                perm,
                mtime,
            })
        }
        NodeKind::Generated(_) | NodeKind::Deferred(_) => Err(VfsError::invalid_operation(
            format!("cannot snapshot {:?}", node.name()),
        )),
    }
}

/// Build live nodes for `sub`, owned by `core`.
fn materialize(core: &Arc<FsCore>, sub: &SubtreeNode) -> NodeRef {
    match sub {
        SubtreeNode::File {
            segments,
            perm,
            mtime,
        } => Node::new_file(core, FileState::with_segments(segments.clone(), *perm, *mtime)),
        SubtreeNode::Dir {
            children,
            perm,
            mtime,
        } => {
            let dir = Node::new_dir(core, *perm, *mtime);
            if let Some(lock) = dir.dir() {
                let mut state = lock.write();
                for (name, child) in children {
                    let node = materialize(core, child);
                    node.set_link(&dir, name);
                    state.children.insert(name.clone(), node);
                }
                state.mtime = *mtime;
            }
            dir
        }
    }
}

/// Replace `node` with a fresh copy of `sub`.
///
/// A directory replaced by a directory keeps its identity and gets new
/// children; otherwise the node is swapped out in its parent.
pub(crate) fn splice(node: &NodeRef, sub: &Subtree) -> VfsResult<()> {
    let node = node.resolve()?;
    let core = node.core();
    match (node.kind(), &sub.root) {
        (
            NodeKind::Dir(lock),
            SubtreeNode::Dir {
                children, mtime, ..
            },
        ) => {
            let fresh: Vec<(String, NodeRef)> = children
                .iter()
                .map(|(name, child)| (name.clone(), materialize(core, child)))
                .collect();
            let mut state = lock.write();
            state.children.clear();
            for (name, child) in fresh {
                child.set_link(&node, &name);
                state.children.insert(name, child);
            }
            state.mtime = *mtime;
            Ok(())
        }
        (NodeKind::Dir(_), SubtreeNode::File { .. }) if node.is_root() => Err(
            VfsError::invalid_operation("cannot replace a top-level directory with a file"),
        ),
        (NodeKind::Dir(_) | NodeKind::File(_), _) => {
            let parent = node.parent();
            let name = node.name();
            let Some(lock) = parent.dir() else {
                return Err(VfsError::not_a_directory(parent.name()));
            };
            let replacement = materialize(core, &sub.root);
            replace_child(&parent, &mut lock.write(), &name, |_| Ok(Some(replacement)))?;
            Ok(())
        }
        (NodeKind::Generated(_) | NodeKind::Deferred(_), _) => Err(VfsError::invalid_operation(
            format!("cannot splice over {:?}", node.name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keepfs_cas::MemoryBlockStore;

    use crate::{CollectionFs, ErrorKind, FsConfig};

    fn fs() -> CollectionFs {
        CollectionFs::new(Arc::new(MemoryBlockStore::new()), FsConfig::default())
    }

    #[test]
    fn test_snapshot_is_detached() {
        let fs = fs();
        fs.mkdir("d", 0).unwrap();
        fs.write_file("d/f", b"before").unwrap();
        let snap = fs.snapshot("d").unwrap();
        assert!(snap.is_dir());
        assert_eq!(snap.size(), 6);

        fs.write_file("d/f", b"after!").unwrap();
        fs.splice("copy", &snap).unwrap();
        assert_eq!(fs.read_file("copy/f").unwrap(), b"before");
        assert_eq!(fs.read_file("d/f").unwrap(), b"after!");

        fs.write_file("copy/f", b"changed").unwrap();
        assert_eq!(fs.read_file("d/f").unwrap(), b"after!");
    }

    #[test]
    fn test_splice_dir_over_dir_replaces_children() {
        let fs = fs();
        fs.mkdir("src", 0).unwrap();
        fs.write_file("src/a", b"a").unwrap();
        fs.mkdir("dst", 0).unwrap();
        fs.write_file("dst/old", b"old").unwrap();
        let snap = fs.snapshot("src").unwrap();
        fs.splice("dst", &snap).unwrap();
        let names: Vec<String> = fs.read_dir("dst").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["a"]);
    }

    #[test]
    fn test_splice_file_over_root_rejected() {
        let fs = fs();
        fs.write_file("f", b"x").unwrap();
        let snap = fs.snapshot("f").unwrap();
        let err = fs.splice("", &snap).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }
}
