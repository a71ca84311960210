//! Open file handles.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, SeekFrom};

use tracing::debug;

use crate::error::{VfsError, VfsResult};
use crate::file::SeekPtr;
use crate::flush::pack_files;
use crate::node::{NodeKind, NodeRef};
use crate::types::{FileInfo, OpenFlags};

/// A cursor over one node, as returned by `open_file`.
///
/// Handles on the same node share its content; each keeps its own
/// position.
pub struct FileHandle {
    node: NodeRef,
    ptr: SeekPtr,
    readable: bool,
    writable: bool,
    append: bool,
    // Remaining entries for incremental readdir.
    unread: Option<VecDeque<FileInfo>>,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("name", &self.node.name())
            .field("offset", &self.ptr.off)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("append", &self.append)
            .finish()
    }
}

fn to_offset(off: i64) -> VfsResult<usize> {
    usize::try_from(off).map_err(|_| {
        if off < 0 {
            VfsError::NegativeOffset
        } else {
            VfsError::invalid_argument(format!("offset {off} out of range"))
        }
    })
}

impl FileHandle {
    pub(crate) fn new(node: NodeRef, flags: OpenFlags) -> Self {
        Self {
            node,
            ptr: SeekPtr::at(0),
            readable: flags.read,
            writable: flags.write,
            append: flags.append,
            unread: None,
        }
    }

    /// Current position.
    pub fn position(&self) -> u64 {
        self.ptr.off as u64
    }

    /// Read at the current position and advance past the bytes read.
    /// Zero means end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let (n, ptr) = self.read_from(buf, self.ptr)?;
        self.ptr = ptr;
        Ok(n)
    }

    /// Read at `off` without moving the cursor.
    pub fn read_at(&self, buf: &mut [u8], off: i64) -> VfsResult<usize> {
        let off = to_offset(off)?;
        let (n, _) = self.read_from(buf, SeekPtr::at(off))?;
        Ok(n)
    }

    fn read_from(&self, buf: &mut [u8], start: SeekPtr) -> VfsResult<(usize, SeekPtr)> {
        if !self.readable {
            return Err(VfsError::WriteOnlyMode);
        }
        let node = self.node.resolve()?;
        match node.kind() {
            NodeKind::File(lock) => lock.read().read(node.core().store.as_ref(), buf, start),
            NodeKind::Generated(g) => {
                let data = g.content()?;
                let mut ptr = start;
                let from = ptr.off.min(data.len());
                let n = buf.len().min(data.len() - from);
                buf[..n].copy_from_slice(&data[from..from + n]);
                ptr.off += n;
                Ok((n, ptr))
            }
            NodeKind::Dir(_) | NodeKind::Deferred(_) => Err(VfsError::invalid_operation(
                format!("cannot read directory {:?}", node.name()),
            )),
        }
    }

    /// Write at the current position (or at end of file in append mode)
    /// and advance past the bytes written.
    pub fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        let (n, ptr) = self.write_from(data, self.ptr)?;
        self.ptr = ptr;
        Ok(n)
    }

    /// Write at `off` without moving the cursor. In append mode the data
    /// still goes to the end of the file.
    pub fn write_at(&self, data: &[u8], off: i64) -> VfsResult<usize> {
        let off = to_offset(off)?;
        let (n, _) = self.write_from(data, SeekPtr::at(off))?;
        Ok(n)
    }

    fn write_from(&self, data: &[u8], start: SeekPtr) -> VfsResult<(usize, SeekPtr)> {
        if !self.writable {
            return Err(VfsError::ReadOnlyFile);
        }
        let node = self.node.resolve()?;
        let NodeKind::File(lock) = node.kind() else {
            return Err(VfsError::invalid_operation(format!(
                "cannot write {:?}",
                node.name()
            )));
        };
        let core = node.core();
        let mut file = lock.write();
        let start = if self.append {
            SeekPtr::at(file.size())
        } else {
            start
        };
        Ok(file.write(core.store.as_ref(), core.max_block_size(), data, start))
    }

    /// Move the cursor. A negative result is rejected and the cursor
    /// stays where it was; positions past end of file are allowed.
    pub fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let current = self.ptr.off as i128;
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(delta) => current + i128::from(delta),
            SeekFrom::End(delta) => self.stat()?.size as i128 + i128::from(delta),
        };
        if target < 0 {
            return Err(VfsError::NegativeOffset);
        }
        let target = usize::try_from(target)
            .map_err(|_| VfsError::invalid_argument(format!("offset {target} out of range")))?;
        if target != self.ptr.off {
            self.ptr = SeekPtr::at(target);
        }
        Ok(target as u64)
    }

    /// Set the file size, zero-filling on growth. The cursor does not
    /// move.
    pub fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if !self.writable {
            return Err(VfsError::ReadOnlyFile);
        }
        let size = usize::try_from(size)
            .map_err(|_| VfsError::invalid_argument(format!("size {size} out of range")))?;
        let node = self.node.resolve()?;
        let NodeKind::File(lock) = node.kind() else {
            return Err(VfsError::invalid_operation(format!(
                "cannot truncate {:?}",
                node.name()
            )));
        };
        lock.write().truncate(size, node.core().max_block_size());
        Ok(())
    }

    /// List directory entries.
    ///
    /// With `count <= 0` every entry is returned. Otherwise at most
    /// `count` entries are returned, continuing from the previous call;
    /// an empty batch means the listing is exhausted.
    pub fn readdir(&mut self, count: isize) -> VfsResult<Vec<FileInfo>> {
        let node = self.node.resolve()?;
        let Some(lock) = node.dir() else {
            return Err(VfsError::invalid_operation(format!(
                "{:?} is not a directory",
                node.name()
            )));
        };
        let children: Vec<NodeRef> = lock.read().children.values().cloned().collect();
        if count <= 0 {
            return children.iter().map(|c| c.info()).collect();
        }
        if self.unread.is_none() {
            let all = children
                .iter()
                .map(|c| c.info())
                .collect::<VfsResult<VecDeque<_>>>()?;
            self.unread = Some(all);
        }
        let Some(unread) = self.unread.as_mut() else {
            return Ok(Vec::new());
        };
        let n = unread.len().min(count.unsigned_abs());
        Ok(unread.drain(..n).collect())
    }

    /// Metadata for the open node.
    pub fn stat(&self) -> VfsResult<FileInfo> {
        self.node.info()
    }

    /// Commit the file's memory segments, partial blocks included.
    pub fn sync(&self) -> VfsResult<()> {
        let node = self.node.resolve()?;
        let NodeKind::File(lock) = node.kind() else {
            return Ok(());
        };
        let core = node.core();
        let mut files = [lock.write()];
        pack_files(core.store.as_ref(), core.max_block_size(), &mut files, true)
    }

    /// Release the handle.
    pub fn close(self) -> VfsResult<()> {
        debug!(name = %self.node.name(), "closed");
        Ok(())
    }
}

impl io::Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileHandle::read(self, buf).map_err(Into::into)
    }
}

impl io::Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileHandle::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        FileHandle::seek(self, pos).map_err(Into::into)
    }
}
