//! File content segments.
//!
//! A file is an ordered list of segments with no gaps or overlaps. A
//! segment is either a mutable in-memory buffer or a window into an
//! immutable stored block. Slicing never mutates shared data: memory
//! slices are copied, stored slices narrow the window.

use keepfs_cas::{BlockStore, CasError, Locator};

use crate::error::VfsResult;

const INITIAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) enum Segment {
    Memory(MemSegment),
    Stored(StoredSegment),
}

impl Segment {
    pub(crate) fn len(&self) -> usize {
        match self {
            Segment::Memory(m) => m.len(),
            Segment::Stored(s) => s.length,
        }
    }

    pub(crate) fn is_memory(&self) -> bool {
        matches!(self, Segment::Memory(_))
    }

    /// Subrange starting at `off`; `len` of `None` runs to the end.
    pub(crate) fn slice(&self, off: usize, len: Option<usize>) -> Segment {
        match self {
            Segment::Memory(m) => Segment::Memory(m.slice(off, len)),
            Segment::Stored(s) => Segment::Stored(s.slice(off, len)),
        }
    }

    /// Copy bytes starting at `off` into `buf`; returns the count copied,
    /// short when the segment ends first.
    pub(crate) fn read_at(
        &self,
        store: &dyn BlockStore,
        buf: &mut [u8],
        off: usize,
    ) -> VfsResult<usize> {
        match self {
            Segment::Memory(m) => Ok(m.read_at(buf, off)),
            Segment::Stored(s) => s.read_at(store, buf, off),
        }
    }

    /// Approximate heap footprint.
    pub(crate) fn memory_size(&self) -> usize {
        match self {
            Segment::Memory(m) => 64 + m.buf.capacity(),
            Segment::Stored(s) => 64 + s.locator.hash().len() + 16,
        }
    }
}

/// An owned, growable buffer.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemSegment {
    buf: Vec<u8>,
}

impl MemSegment {
    /// A zero-filled segment of `len` bytes.
    pub(crate) fn zeroed(len: usize) -> Self {
        let mut seg = Self::default();
        seg.truncate(len);
        seg
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Resize to `n` bytes.
    ///
    /// Growth zero-fills and reserves geometrically; shrinking zeroes the
    /// dropped tail first so a later regrow cannot expose stale bytes.
    pub(crate) fn truncate(&mut self, n: usize) {
        let len = self.buf.len();
        if n > len {
            if n > self.buf.capacity() {
                let mut cap = self.buf.capacity().max(INITIAL_CAPACITY);
                while cap < n {
                    cap = cap.saturating_mul(4);
                }
                self.buf.reserve_exact(cap - len);
            }
            self.buf.resize(n, 0);
        } else if n < len {
            self.buf[n..].fill(0);
            self.buf.truncate(n);
        }
    }

    /// Overwrite bytes at `off`. The range must already exist.
    pub(crate) fn write_at(&mut self, data: &[u8], off: usize) {
        let end = off + data.len();
        assert!(
            end <= self.buf.len(),
            "memory segment overrun: write {}..{} past length {}",
            off,
            end,
            self.buf.len()
        );
        self.buf[off..end].copy_from_slice(data);
    }

    pub(crate) fn read_at(&self, buf: &mut [u8], off: usize) -> usize {
        if off >= self.buf.len() {
            return 0;
        }
        let n = buf.len().min(self.buf.len() - off);
        buf[..n].copy_from_slice(&self.buf[off..off + n]);
        n
    }

    pub(crate) fn slice(&self, off: usize, len: Option<usize>) -> MemSegment {
        let end = match len {
            Some(len) => off + len,
            None => self.buf.len(),
        };
        MemSegment {
            buf: self.buf[off..end].to_vec(),
        }
    }
}

/// A window into a stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredSegment {
    pub(crate) locator: Locator,
    /// Size of the whole block.
    pub(crate) size: usize,
    /// Start of the window within the block.
    pub(crate) offset: usize,
    pub(crate) length: usize,
}

impl StoredSegment {
    pub(crate) fn slice(&self, off: usize, len: Option<usize>) -> StoredSegment {
        let mut seg = self.clone();
        seg.offset += off;
        seg.length -= off;
        if let Some(len) = len {
            seg.length = seg.length.min(len);
        }
        seg
    }

    fn read_at(&self, store: &dyn BlockStore, buf: &mut [u8], off: usize) -> VfsResult<usize> {
        if off >= self.length {
            return Ok(0);
        }
        let want = buf.len().min(self.length - off);
        let n = store.read_at(&self.locator, &mut buf[..want], (self.offset + off) as u64)?;
        if n == 0 && want > 0 {
            return Err(CasError::ShortBlock {
                locator: self.locator.to_string(),
                expected: self.size as u64,
                actual: (self.offset + off) as u64,
            }
            .into());
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepfs_cas::MemoryBlockStore;

    #[test]
    fn test_truncate_zeroes_tail() {
        let mut seg = MemSegment::zeroed(4);
        seg.write_at(b"abcd", 0);
        seg.truncate(2);
        seg.truncate(4);
        assert_eq!(seg.as_slice(), b"ab\0\0");
    }

    #[test]
    fn test_truncate_grows_geometrically() {
        let mut seg = MemSegment::default();
        seg.truncate(10);
        assert!(seg.buf.capacity() >= 1024);
        seg.truncate(2000);
        assert!(seg.buf.capacity() >= 4096);
        assert_eq!(seg.len(), 2000);
    }

    #[test]
    fn test_mem_slice_is_independent() {
        let mut seg = MemSegment::zeroed(6);
        seg.write_at(b"foobar", 0);
        let tail = seg.slice(3, None);
        seg.write_at(b"BAR", 3);
        assert_eq!(tail.as_slice(), b"bar");
        assert_eq!(seg.slice(1, Some(2)).as_slice(), b"oo");
    }

    #[test]
    #[should_panic(expected = "memory segment overrun")]
    fn test_write_past_end_panics() {
        let mut seg = MemSegment::zeroed(2);
        seg.write_at(b"abc", 0);
    }

    #[test]
    fn test_stored_window() {
        let store = MemoryBlockStore::new();
        let locator = store.insert(b"foobar");
        let seg = Segment::Stored(StoredSegment {
            locator,
            size: 6,
            offset: 0,
            length: 6,
        });
        let bar = seg.slice(3, None);
        let mut buf = [0u8; 8];
        assert_eq!(bar.len(), 3);
        assert_eq!(bar.read_at(&store, &mut buf, 0).unwrap(), 3);
        assert_eq!(&buf[..3], b"bar");
        assert_eq!(bar.read_at(&store, &mut buf, 3).unwrap(), 0);

        let o = seg.slice(1, Some(1));
        assert_eq!(o.read_at(&store, &mut buf, 0).unwrap(), 1);
        assert_eq!(buf[0], b'o');
    }
}
