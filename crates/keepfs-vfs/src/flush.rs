//! Packing memory segments into stored blocks.
//!
//! Small memory segments from several files in one directory share a
//! block; anything over half the max block size gets a block of its own.
//! Each committed block rewrites its contributors as stored segments in
//! place, so a failure part-way leaves earlier blocks committed.

use std::ops::DerefMut;

use keepfs_cas::BlockStore;
use tracing::debug;

use crate::error::VfsResult;
use crate::file::FileState;
use crate::node::{DirState, NodeKind};
use crate::segment::{Segment, StoredSegment};

/// Concatenate the memory segments named by `refs` (file index, segment
/// index), store them as one block, and point each contributor at its
/// window of the new block.
pub(crate) fn commit_block<G>(
    store: &dyn BlockStore,
    files: &mut [G],
    refs: &[(usize, usize)],
) -> VfsResult<()>
where
    G: DerefMut<Target = FileState>,
{
    if refs.is_empty() {
        return Ok(());
    }
    let mut block = Vec::new();
    for &(fi, si) in refs {
        match &files[fi].segments[si] {
            Segment::Memory(m) => block.extend_from_slice(m.as_slice()),
            Segment::Stored(_) => panic!("commit_block: segment {si} of file {fi} is already stored"),
        }
    }
    let resp = store.write_block(&block)?;
    debug!(
        locator = %resp.locator,
        len = block.len(),
        segments = refs.len(),
        replicas = resp.replicas,
        "committed block"
    );
    let mut offset = 0;
    for &(fi, si) in refs {
        let length = files[fi].segments[si].len();
        files[fi].replace_flushed(
            si,
            Segment::Stored(StoredSegment {
                locator: resp.locator.clone(),
                size: block.len(),
                offset,
                length,
            }),
        );
        offset += length;
    }
    Ok(())
}

/// Flush the memory segments of `files`, visited in order.
///
/// With `short_blocks` false a trailing partial block stays in memory for
/// later writes to fill.
pub(crate) fn pack_files<G>(
    store: &dyn BlockStore,
    max_block_size: usize,
    files: &mut [G],
    short_blocks: bool,
) -> VfsResult<()>
where
    G: DerefMut<Target = FileState>,
{
    let mut pending: Vec<(usize, usize)> = Vec::new();
    let mut pending_len = 0;
    for fi in 0..files.len() {
        for si in 0..files[fi].segments.len() {
            let seg = &files[fi].segments[si];
            if !seg.is_memory() {
                continue;
            }
            let len = seg.len();
            if len > max_block_size / 2 {
                commit_block(store, files, &[(fi, si)])?;
                continue;
            }
            if pending_len + len > max_block_size {
                commit_block(store, files, &pending)?;
                pending.clear();
                pending_len = 0;
            }
            pending.push((fi, si));
            pending_len += len;
        }
    }
    if short_blocks {
        commit_block(store, files, &pending)?;
    }
    Ok(())
}

/// Flush the files of one directory, and with `recursive` every
/// directory below it. Mount points belonging to another tree are skipped.
///
/// The caller holds `dir`'s lock; child locks are taken here, top-down.
pub(crate) fn flush_dir(
    dir: &DirState,
    fs_id: u64,
    store: &dyn BlockStore,
    max_block_size: usize,
    recursive: bool,
    short_blocks: bool,
) -> VfsResult<()> {
    if recursive {
        for child in dir.children.values() {
            if child.fs_id() != fs_id {
                continue;
            }
            if let NodeKind::Dir(lock) = child.kind() {
                let sub = lock.write();
                flush_dir(&sub, fs_id, store, max_block_size, true, short_blocks)?;
            }
        }
    }
    let mut files = Vec::new();
    for child in dir.children.values() {
        if child.fs_id() != fs_id {
            continue;
        }
        if let NodeKind::File(lock) = child.kind() {
            files.push(lock.write());
        }
    }
    pack_files(store, max_block_size, &mut files, short_blocks)
}
