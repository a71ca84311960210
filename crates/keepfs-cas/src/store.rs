//! The block storage trait.

use crate::error::CasResult;
use crate::locator::Locator;

/// Result of storing one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWriteResponse {
    /// Locator of the stored block, possibly carrying backend hints.
    pub locator: Locator,
    /// Number of replicas the backend reports as written.
    pub replicas: u32,
}

/// Random-access reads and whole-block writes against a block backend.
///
/// Implementations must be safe to share between threads; callers never
/// coordinate access beyond holding their own per-file locks. Retry,
/// replication and caching are the backend's business.
pub trait BlockStore: Send + Sync {
    /// Copy bytes of the block at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied, which is short when the block
    /// ends before `buf` is full and zero when `offset` is at or past the
    /// end of the block.
    fn read_at(&self, locator: &Locator, buf: &mut [u8], offset: u64) -> CasResult<usize>;

    /// Store `data` as a new block.
    fn write_block(&self, data: &[u8]) -> CasResult<BlockWriteResponse>;
}

/// Copy the window of `block` starting at `offset` into `buf`.
pub(crate) fn copy_window(block: &[u8], buf: &mut [u8], offset: u64) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= block.len() {
        return 0;
    }
    let n = buf.len().min(block.len() - start);
    buf[..n].copy_from_slice(&block[start..start + n]);
    n
}
