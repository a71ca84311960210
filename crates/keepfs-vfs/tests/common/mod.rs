//! Shared helpers for keepfs-vfs integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use keepfs_cas::MemoryBlockStore;
use keepfs_vfs::{CollectionFs, FsConfig};
use tracing_subscriber::{EnvFilter, fmt};

/// Base collection: `dir1/foo` = "foo" and `dir1/bar` = "bar", sharing
/// one stored block.
pub const FOO_AND_BAR_IN_DIR: &str = "./dir1 3858f62230ac3c915f300c664312c63f+6 3:3:bar 0:3:foo\n";

/// Route library logs to the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn store() -> Arc<MemoryBlockStore> {
    Arc::new(MemoryBlockStore::new())
}

pub fn small_blocks() -> FsConfig {
    FsConfig::default().with_max_block_size(8)
}

pub fn empty_fs(config: FsConfig) -> (CollectionFs, Arc<MemoryBlockStore>) {
    init_tracing();
    let store = store();
    let fs = CollectionFs::new(store.clone(), config);
    (fs, store)
}

/// The base collection, with its one block already in the store.
pub fn foo_and_bar(config: FsConfig) -> (CollectionFs, Arc<MemoryBlockStore>) {
    init_tracing();
    let store = store();
    store.insert(b"foobar");
    let fs = CollectionFs::from_manifest(FOO_AND_BAR_IN_DIR, store.clone(), config)
        .expect("base manifest parses");
    (fs, store)
}

/// Drop the hints from every locator in `manifest`.
pub fn strip_hints(manifest: &str) -> String {
    manifest
        .split('\n')
        .map(|line| {
            line.split(' ')
                .map(|tok| match tok.split_once('+') {
                    Some((hash, rest)) if hash.len() == 32 && !tok.contains(':') => {
                        let size = rest.split('+').next().unwrap_or_default();
                        format!("{hash}+{size}")
                    }
                    _ => tok.to_owned(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
