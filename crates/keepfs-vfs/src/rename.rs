//! Rename and its locking protocol.
//!
//! Rename is the only operation that locks two directories that are not
//! parent and child. To keep it deadlock-free against other renames and
//! against top-down walkers:
//!
//! 1. the tree-wide `rename_lock` is taken first, so at most one rename
//!    per tree is collecting locks;
//! 2. the source and destination directories and all their ancestors in
//!    the same tree are write-locked, shallowest first, ties broken by
//!    node address.
//!
//! Holding the ancestors also makes the "moving a directory into its own
//! subtree" check race-free: the moved node is an ancestor of the
//! destination exactly when it is among the locked nodes.

use std::sync::Arc;

use crate::error::{VfsError, VfsResult};
use crate::fs::{open_dir, split_path};
use crate::node::{lookup, replace_child, NodeKind, NodeRef};

/// Every directory from `dirs` up to their tree's root, deduplicated and
/// in locking order.
pub(crate) fn lock_order(dirs: &[&NodeRef]) -> Vec<NodeRef> {
    let mut entries: Vec<(usize, NodeRef)> = Vec::new();
    for &dir in dirs {
        let mut chain = vec![Arc::clone(dir)];
        let mut node = Arc::clone(dir);
        loop {
            let parent = node.parent();
            if Arc::ptr_eq(&parent, &node) || parent.fs_id() != node.fs_id() {
                break;
            }
            chain.push(Arc::clone(&parent));
            node = parent;
        }
        let depth_of_dir = chain.len() - 1;
        for (i, n) in chain.into_iter().enumerate() {
            if !entries.iter().any(|(_, e)| Arc::ptr_eq(e, &n)) {
                entries.push((depth_of_dir - i, n));
            }
        }
    }
    entries.sort_by_key(|(depth, n)| (*depth, Arc::as_ptr(n) as usize));
    entries.into_iter().map(|(_, n)| n).collect()
}

fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b);
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

pub(crate) fn rename(root: &NodeRef, old: &str, new: &str) -> VfsResult<()> {
    let (old_dir_path, old_name) = split_path(old);
    if matches!(old_name, "" | "." | "..") {
        return Err(VfsError::invalid_argument(format!("cannot rename {old:?}")));
    }
    let (new_dir_path, mut new_name) = split_path(new);
    if matches!(new_name, "." | "..") {
        return Err(VfsError::invalid_argument(format!("cannot rename to {new:?}")));
    }
    if new_name.is_empty() {
        new_name = old_name;
    }

    let old_dir = open_dir(root, old_dir_path)?;
    let new_dir = open_dir(root, new_dir_path)?;

    let core = Arc::clone(old_dir.core());
    let _tree = core.rename_lock.lock();
    if new_dir.fs_id() != core.id {
        return Err(VfsError::invalid_operation(format!(
            "cannot move {old:?} to {new:?} in another collection"
        )));
    }

    let order = lock_order(&[&old_dir, &new_dir]);
    let mut guards = Vec::with_capacity(order.len());
    for node in &order {
        let lock = node
            .dir()
            .ok_or_else(|| VfsError::not_a_directory(node.name()))?;
        guards.push(lock.write());
    }
    let position = |dir: &NodeRef| order.iter().position(|n| Arc::ptr_eq(n, dir));
    let (Some(oi), Some(ni)) = (position(&old_dir), position(&new_dir)) else {
        return Err(VfsError::invalid_operation("rename lost track of its directories"));
    };

    let moving = lookup(&old_dir, &guards[oi], old_name)?
        .ok_or_else(|| VfsError::not_found(old))?;
    if matches!(moving.kind(), NodeKind::Generated(_)) {
        return Err(VfsError::invalid_operation(format!("cannot rename {old:?}")));
    }
    if order.iter().any(|n| Arc::ptr_eq(n, &moving)) {
        return Err(VfsError::invalid_argument(format!(
            "cannot move {old:?} into itself"
        )));
    }
    if oi != ni && moving.is_mount_point(core.id) {
        return Err(VfsError::invalid_argument(format!(
            "cannot move mount point {old:?} to another directory"
        )));
    }
    if oi == ni && old_name == new_name {
        return Ok(());
    }
    if let Some(existing) = lookup(&new_dir, &guards[ni], new_name)? {
        if existing.is_dir() {
            return Err(VfsError::is_a_directory(new));
        }
        if moving.is_dir() {
            return Err(VfsError::is_a_directory(old));
        }
    }

    if oi == ni {
        let state = &mut *guards[oi];
        replace_child(&new_dir, state, new_name, |_| Ok(Some(Arc::clone(&moving))))?;
        replace_child(&old_dir, state, old_name, |_| Ok(None))?;
    } else {
        let (old_guard, new_guard) = pair_mut(&mut guards, oi, ni);
        replace_child(&new_dir, new_guard, new_name, |_| Ok(Some(Arc::clone(&moving))))?;
        replace_child(&old_dir, old_guard, old_name, |_| Ok(None))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::rlookup;
    use crate::{CollectionFs, ErrorKind, FsConfig};
    use keepfs_cas::MemoryBlockStore;

    fn tree() -> CollectionFs {
        let fs = CollectionFs::new(Arc::new(MemoryBlockStore::new()), FsConfig::default());
        fs.mkdir("a", 0).unwrap();
        fs.mkdir("a/b", 0).unwrap();
        fs.mkdir("c", 0).unwrap();
        fs
    }

    #[test]
    fn test_lock_order_is_root_first_and_deduplicated() {
        let fs = tree();
        let root = Arc::clone(fs.root_node());
        let b = rlookup(&root, "a/b").unwrap();
        let c = rlookup(&root, "c").unwrap();
        let order = lock_order(&[&b, &c]);
        assert_eq!(order.len(), 4);
        assert!(Arc::ptr_eq(&order[0], &root));
        assert!(Arc::ptr_eq(&order[3], &b));
        let names: Vec<String> = order[1..3].iter().map(|n| n.name()).collect();
        assert!(names.contains(&"a".to_owned()) && names.contains(&"c".to_owned()));
    }

    #[test]
    fn test_pair_mut() {
        let mut v = vec![1, 2, 3];
        let (x, y) = pair_mut(&mut v, 2, 0);
        std::mem::swap(x, y);
        assert_eq!(v, [3, 2, 1]);
    }

    #[test]
    fn test_into_own_subtree_rejected() {
        let fs = tree();
        let err = fs.rename("a", "a/b/a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(fs.stat("a/b").is_ok());
    }
}
