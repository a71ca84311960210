//! Directory-backed block store.
//!
//! Blocks are written as `<root>/<hash[..3]>/<hash>` files. Writes go to a
//! temporary name first and are renamed into place, so a reader never sees
//! a partial block.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{CasError, CasResult};
use crate::locator::Locator;
use crate::store::{BlockStore, BlockWriteResponse};

/// Block store rooted at a local directory.
#[derive(Debug)]
pub struct DirBlockStore {
    root: PathBuf,
    tmp_seq: AtomicU64,
}

impl DirBlockStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> CasResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..3]).join(hash)
    }
}

impl BlockStore for DirBlockStore {
    fn read_at(&self, locator: &Locator, buf: &mut [u8], offset: u64) -> CasResult<usize> {
        let path = self.block_path(locator.hash());
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::not_found(locator.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let actual = file.metadata()?.len();
        if actual < locator.size() {
            return Err(CasError::ShortBlock {
                locator: locator.to_string(),
                expected: locator.size(),
                actual,
            });
        }
        if offset >= actual {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn write_block(&self, data: &[u8]) -> CasResult<BlockWriteResponse> {
        let locator = Locator::for_data(data);
        let path = self.block_path(locator.hash());
        if !path.exists() {
            let dir = path
                .parent()
                .ok_or_else(|| CasError::backend("block path has no parent"))?;
            fs::create_dir_all(dir)?;
            let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
            let tmp = dir.join(format!(".{}.tmp{}", locator.hash(), seq));
            {
                let mut file = File::create(&tmp)?;
                file.write_all(data)?;
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)?;
        }
        debug!(locator = %locator, path = %path.display(), "stored block");
        Ok(BlockWriteResponse {
            locator,
            replicas: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirBlockStore::open(tmp.path().join("blocks")).unwrap();
        let resp = store.write_block(b"hello world").unwrap();
        assert_eq!(resp.locator.size(), 11);

        let mut buf = [0u8; 5];
        assert_eq!(store.read_at(&resp.locator, &mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(store.read_at(&resp.locator, &mut buf, 11).unwrap(), 0);

        // Rewriting identical content is a no-op.
        let again = store.write_block(b"hello world").unwrap();
        assert_eq!(again.locator, resp.locator);
    }

    #[test]
    fn test_missing_block() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirBlockStore::open(tmp.path()).unwrap();
        let mut buf = [0u8; 1];
        let err = store
            .read_at(&Locator::for_data(b"absent"), &mut buf, 0)
            .unwrap_err();
        assert!(matches!(err, CasError::NotFound(_)));
    }
}
