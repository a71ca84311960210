//! In-memory block store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{CasError, CasResult};
use crate::locator::Locator;
use crate::store::{copy_window, BlockStore, BlockWriteResponse};

/// Blocks kept in a process-local map, keyed by content hash.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone)]
pub struct MemoryBlockStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    blocks: RwLock<HashMap<String, Arc<[u8]>>>,
    replicas: u32,
    fail_writes: AtomicBool,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemoryBlockStore {
    /// Create an empty store reporting one replica per write.
    pub fn new() -> Self {
        Self::with_replicas(1)
    }

    /// Create an empty store reporting `replicas` copies per write.
    pub fn with_replicas(replicas: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                blocks: RwLock::new(HashMap::new()),
                replicas,
                fail_writes: AtomicBool::new(false),
                writes: AtomicU64::new(0),
                reads: AtomicU64::new(0),
            }),
        }
    }

    /// Store a block directly, bypassing the write counter.
    pub fn insert(&self, data: &[u8]) -> Locator {
        let locator = Locator::for_data(data);
        self.inner
            .blocks
            .write()
            .insert(locator.hash().to_owned(), Arc::from(data));
        locator
    }

    /// Make every subsequent `write_block` fail until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `write_block` calls.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of `read_at` calls.
    pub fn read_count(&self) -> u64 {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Number of distinct blocks held.
    pub fn len(&self) -> usize {
        self.inner.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full content of a block, if present.
    pub fn get(&self, locator: &Locator) -> Option<Vec<u8>> {
        self.inner
            .blocks
            .read()
            .get(locator.hash())
            .map(|b| b.to_vec())
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_at(&self, locator: &Locator, buf: &mut [u8], offset: u64) -> CasResult<usize> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        let blocks = self.inner.blocks.read();
        let block = blocks
            .get(locator.hash())
            .ok_or_else(|| CasError::not_found(locator.to_string()))?;
        Ok(copy_window(block, buf, offset))
    }

    fn write_block(&self, data: &[u8]) -> CasResult<BlockWriteResponse> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(CasError::backend("write_block: injected failure"));
        }
        let locator = self.insert(data);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        debug!(locator = %locator, len = data.len(), "stored block");
        Ok(BlockWriteResponse {
            locator,
            replicas: self.inner.replicas,
        })
    }
}
