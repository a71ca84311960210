//! File content engine: seek, read, write and truncate over a segment list.
//!
//! The engine keeps a file's segment list short. Writes overwrite memory
//! segments in place, grow a preceding memory segment when it has room,
//! and split stored segments only where a write lands inside one. No
//! memory segment ever exceeds the configured max block size, and any
//! segment that reaches it is written out to the block store right away.

use std::time::SystemTime;

use keepfs_cas::BlockStore;
use tracing::warn;

use crate::error::VfsResult;
use crate::flush::commit_block;
use crate::segment::{MemSegment, Segment};

/// Cached mapping from a byte offset to a position in the segment list.
///
/// `segment_idx`/`segment_off` are only trusted while `repacked` matches
/// the file's current repack generation; otherwise they are recomputed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SeekPtr {
    pub(crate) off: usize,
    pub(crate) segment_idx: usize,
    pub(crate) segment_off: usize,
    pub(crate) repacked: Option<u64>,
}

impl SeekPtr {
    /// A pointer at `off` with no cached position.
    pub(crate) fn at(off: usize) -> Self {
        Self {
            off,
            ..Default::default()
        }
    }
}

/// Lock-protected state of a file node.
#[derive(Debug)]
pub(crate) struct FileState {
    pub(crate) segments: Vec<Segment>,
    size: usize,
    repacked: u64,
    memsize: usize,
    pub(crate) perm: u32,
    pub(crate) mtime: SystemTime,
}

impl FileState {
    pub(crate) fn new(perm: u32, mtime: SystemTime) -> Self {
        Self {
            segments: Vec::new(),
            size: 0,
            repacked: 0,
            memsize: 0,
            perm,
            mtime,
        }
    }

    /// Build from an existing segment list (snapshot copies).
    pub(crate) fn with_segments(segments: Vec<Segment>, perm: u32, mtime: SystemTime) -> Self {
        let size = segments.iter().map(Segment::len).sum();
        let memsize = segments
            .iter()
            .filter(|s| s.is_memory())
            .map(Segment::len)
            .sum();
        Self {
            segments,
            size,
            repacked: 0,
            memsize,
            perm,
            mtime,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently held in memory segments.
    pub(crate) fn memsize(&self) -> usize {
        self.memsize
    }

    /// Append a segment at the end of the file (manifest loading).
    pub(crate) fn append_segment(&mut self, seg: Segment) {
        if seg.is_memory() {
            self.memsize += seg.len();
        }
        self.size += seg.len();
        self.segments.push(seg);
    }

    /// Replace a memory segment with a stored one of the same length.
    pub(crate) fn replace_flushed(&mut self, idx: usize, seg: Segment) {
        debug_assert_eq!(self.segments[idx].len(), seg.len());
        if self.segments[idx].is_memory() {
            self.memsize -= self.segments[idx].len();
        }
        self.segments[idx] = seg;
    }

    pub(crate) fn memory_size(&self) -> usize {
        64 + self.segments.iter().map(Segment::memory_size).sum::<usize>()
    }

    /// Resolve `start` to a segment position.
    ///
    /// At or past EOF the result points one past the last segment.
    pub(crate) fn seek(&self, start: SeekPtr) -> SeekPtr {
        let mut ptr = start;
        if ptr.off >= self.size {
            ptr.segment_idx = self.segments.len();
            ptr.segment_off = 0;
            ptr.repacked = Some(self.repacked);
            return ptr;
        }
        if ptr.repacked == Some(self.repacked) && ptr.segment_idx < self.segments.len() {
            if ptr.segment_off >= self.segments[ptr.segment_idx].len() {
                ptr.segment_idx += 1;
                ptr.segment_off = 0;
            }
            if ptr.segment_idx < self.segments.len() {
                return ptr;
            }
        }
        ptr.repacked = Some(self.repacked);
        let mut pos = 0;
        for (idx, seg) in self.segments.iter().enumerate() {
            let next = pos + seg.len();
            if next > ptr.off {
                ptr.segment_idx = idx;
                ptr.segment_off = ptr.off - pos;
                return ptr;
            }
            pos = next;
        }
        ptr.segment_idx = self.segments.len();
        ptr.segment_off = 0;
        ptr
    }

    /// Read into `buf` starting at `start`, crossing segment boundaries
    /// until `buf` is full or the file ends. Zero means end of file.
    pub(crate) fn read(
        &self,
        store: &dyn BlockStore,
        buf: &mut [u8],
        start: SeekPtr,
    ) -> VfsResult<(usize, SeekPtr)> {
        let mut ptr = self.seek(start);
        let mut n = 0;
        while n < buf.len() && ptr.segment_idx < self.segments.len() {
            let seg = &self.segments[ptr.segment_idx];
            let got = seg.read_at(store, &mut buf[n..], ptr.segment_off)?;
            n += got;
            ptr.off += got;
            ptr.segment_off += got;
            if ptr.segment_off >= seg.len() {
                ptr.segment_idx += 1;
                ptr.segment_off = 0;
            } else if got == 0 {
                break;
            }
        }
        Ok((n, ptr))
    }

    /// Set the file size, zero-filling on growth.
    pub(crate) fn truncate(&mut self, size: usize, max_block_size: usize) {
        if size == self.size {
            return;
        }
        self.repacked += 1;
        self.mtime = SystemTime::now();
        if size < self.size {
            let ptr = self.seek(SeekPtr::at(size));
            for seg in &self.segments[ptr.segment_idx..] {
                if seg.is_memory() {
                    self.memsize -= seg.len();
                }
            }
            if ptr.segment_off == 0 {
                self.segments.truncate(ptr.segment_idx);
            } else {
                let (idx, off) = (ptr.segment_idx, ptr.segment_off);
                self.segments.truncate(idx + 1);
                if let Segment::Memory(m) = &mut self.segments[idx] {
                    m.truncate(off);
                    self.memsize += off;
                } else {
                    self.segments[idx] = self.segments[idx].slice(0, Some(off));
                }
            }
            self.size = size;
            return;
        }
        while size > self.size {
            let needs_new = match self.segments.last() {
                Some(Segment::Memory(m)) => m.len() >= max_block_size,
                _ => true,
            };
            if needs_new {
                self.segments.push(Segment::Memory(MemSegment::default()));
            }
            let Some(Segment::Memory(seg)) = self.segments.last_mut() else {
                unreachable!("tail segment is a memory segment");
            };
            let grow = (size - self.size).min(max_block_size - seg.len());
            seg.truncate(seg.len() + grow);
            self.size += grow;
            self.memsize += grow;
        }
    }

    /// Write `data` at `start`; returns the bytes written and the pointer
    /// just past them.
    pub(crate) fn write(
        &mut self,
        store: &dyn BlockStore,
        max_block_size: usize,
        data: &[u8],
        start: SeekPtr,
    ) -> (usize, SeekPtr) {
        if start.off > self.size {
            self.truncate(start.off, max_block_size);
        }
        let mut ptr = self.seek(start);
        let mut n = 0;
        let mut rest = data;
        while !rest.is_empty() {
            let mut chunk = &rest[..rest.len().min(max_block_size)];
            let cur = ptr.segment_idx;
            let cur_writable = self.segments.get(cur).is_some_and(Segment::is_memory);
            let prev_appendable = cur > 0
                && matches!(&self.segments[cur - 1], Segment::Memory(m) if m.len() < max_block_size);

            if ptr.segment_off > 0 && !cur_writable {
                // Write lands inside a stored segment: keep the untouched
                // prefix (and suffix, if any) and put a new memory segment
                // between them.
                let remaining = self.segments[cur].len() - ptr.segment_off;
                let left = self.segments[cur].slice(0, Some(ptr.segment_off));
                if remaining <= chunk.len() {
                    chunk = &chunk[..remaining];
                    self.segments[cur] = left;
                    self.segments
                        .insert(cur + 1, Segment::Memory(MemSegment::zeroed(chunk.len())));
                } else {
                    let right = self.segments[cur].slice(ptr.segment_off + chunk.len(), None);
                    self.segments[cur] = left;
                    self.segments
                        .insert(cur + 1, Segment::Memory(MemSegment::zeroed(chunk.len())));
                    self.segments.insert(cur + 2, right);
                }
                self.memsize += chunk.len();
                ptr.segment_idx += 1;
                ptr.segment_off = 0;
                self.bump_generation(&mut ptr);
            } else if cur_writable {
                let room = self.segments[cur].len() - ptr.segment_off;
                if room < chunk.len() {
                    chunk = &chunk[..room];
                }
            } else {
                // At a segment boundary (or EOF) in front of a stored
                // segment: consume the bytes we overwrite from `cur`, then
                // either grow the previous memory segment or insert one.
                if prev_appendable {
                    let room = max_block_size - self.segments[cur - 1].len();
                    if room < chunk.len() {
                        chunk = &chunk[..room];
                    }
                }
                if cur == self.segments.len() {
                    self.size += chunk.len();
                } else {
                    let cur_len = self.segments[cur].len();
                    if cur_len <= chunk.len() {
                        chunk = &chunk[..cur_len];
                        self.segments.remove(cur);
                    } else {
                        self.segments[cur] = self.segments[cur].slice(chunk.len(), None);
                    }
                }
                if prev_appendable {
                    let prev = cur - 1;
                    ptr.segment_idx = prev;
                    let Segment::Memory(seg) = &mut self.segments[prev] else {
                        unreachable!("appendable segment is a memory segment");
                    };
                    ptr.segment_off = seg.len();
                    seg.truncate(ptr.segment_off + chunk.len());
                    self.memsize += chunk.len();
                    self.bump_generation(&mut ptr);
                } else {
                    let appending = cur == self.segments.len();
                    self.segments
                        .insert(cur, Segment::Memory(MemSegment::zeroed(chunk.len())));
                    self.memsize += chunk.len();
                    if !appending {
                        self.bump_generation(&mut ptr);
                    }
                }
            }

            let Segment::Memory(seg) = &mut self.segments[ptr.segment_idx] else {
                unreachable!("write target is a memory segment");
            };
            seg.write_at(chunk, ptr.segment_off);
            n += chunk.len();
            rest = &rest[chunk.len()..];
            ptr.off += chunk.len();
            ptr.segment_off += chunk.len();
            if ptr.segment_off >= max_block_size {
                self.flush_full_segments(store, max_block_size);
            }
            if self.segments[ptr.segment_idx].len() == ptr.segment_off {
                ptr.segment_idx += 1;
                ptr.segment_off = 0;
            }
            self.mtime = SystemTime::now();
        }
        (n, ptr)
    }

    fn bump_generation(&mut self, ptr: &mut SeekPtr) {
        self.repacked += 1;
        ptr.repacked = Some(self.repacked);
    }

    /// Write out every memory segment that has reached the max block size.
    ///
    /// Failures are not fatal here: the data stays in memory and the next
    /// flush retries it.
    fn flush_full_segments(&mut self, store: &dyn BlockStore, max_block_size: usize) {
        let full: Vec<usize> = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_memory() && s.len() >= max_block_size)
            .map(|(i, _)| i)
            .collect();
        for idx in full {
            let mut files = [&mut *self];
            if let Err(e) = commit_block(store, &mut files, &[(0, idx)]) {
                warn!(error = %e, len = max_block_size, "eager block flush failed; keeping data in memory");
                return;
            }
        }
    }
}
