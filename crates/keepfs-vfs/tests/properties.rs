//! Whole-tree properties: manifest round trips, size accounting, content
//! fidelity across block boundaries, and concurrent use.

mod common;

use std::sync::Arc;

use common::{empty_fs, foo_and_bar, small_blocks};
use keepfs_vfs::{CollectionFs, ErrorKind, FsConfig, OpenFlags, SeekFrom};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Marshal, reload into a fresh tree over the same store, and marshal
/// again.
fn reload(fs: &CollectionFs, store: &Arc<keepfs_cas::MemoryBlockStore>) -> CollectionFs {
    let text = fs.marshal_manifest(".").unwrap();
    let loaded = CollectionFs::from_manifest(&text, store.clone(), fs.config().clone()).unwrap();
    assert_eq!(loaded.marshal_manifest(".").unwrap(), text);
    loaded
}

#[test]
fn test_round_trip_preserves_tree() {
    let (fs, store) = empty_fs(small_blocks());
    fs.mkdir("a", 0).unwrap();
    fs.mkdir("a/b", 0).unwrap();
    fs.mkdir("empty", 0).unwrap();
    fs.write_file("top", b"top level").unwrap();
    fs.write_file("a/one", b"1").unwrap();
    fs.write_file("a/b/long", &[b'z'; 29]).unwrap();
    fs.write_file("a/b/zero", b"").unwrap();
    fs.write_file("with space", b"spaced").unwrap();

    let loaded = reload(&fs, &store);
    for path in ["top", "a/one", "a/b/long", "a/b/zero", "with space"] {
        assert_eq!(loaded.read_file(path).unwrap(), fs.read_file(path).unwrap(), "{path}");
    }
    assert!(loaded.stat("empty").unwrap().is_dir());
    assert!(loaded.read_dir("empty").unwrap().is_empty());
    assert_eq!(loaded.size(), fs.size());
}

#[test]
fn test_size_matches_content() {
    let (fs, _store) = foo_and_bar(small_blocks());
    let mut f = fs.open_file("dir1/foo", OpenFlags::read_write(), 0).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let off = rng.gen_range(0..40u64);
        match rng.gen_range(0..3) {
            0 => {
                let len = rng.gen_range(0..20);
                let data: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
                f.write_at(&data, off as i64).unwrap();
            }
            1 => f.truncate(off).unwrap(),
            _ => {
                fs.flush("dir1", rng.gen_bool(0.5)).unwrap();
            }
        }
        let size = f.stat().unwrap().size;
        assert_eq!(fs.read_file("dir1/foo").unwrap().len() as u64, size);
        assert_eq!(f.seek(SeekFrom::End(0)).unwrap(), size);
    }
}

#[test]
fn test_random_writes_match_model() {
    let (fs, store) = empty_fs(small_blocks());
    let mut f = fs.create("f").unwrap();
    let mut model: Vec<u8> = Vec::new();
    let mut rng = StdRng::seed_from_u64(42);
    for step in 0..500 {
        match rng.gen_range(0..10) {
            0..=5 => {
                let off = rng.gen_range(0..=model.len() + 10);
                let len = rng.gen_range(1..30);
                let data: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
                f.seek(SeekFrom::Start(off as u64)).unwrap();
                assert_eq!(f.write(&data).unwrap(), len);
                if model.len() < off + len {
                    model.resize(off + len, 0);
                }
                model[off..off + len].copy_from_slice(&data);
            }
            6 => {
                let size = rng.gen_range(0..=model.len() + 10);
                f.truncate(size as u64).unwrap();
                model.resize(size, 0);
            }
            7 => fs.flush("", false).unwrap(),
            8 => fs.flush("", true).unwrap(),
            _ => {
                let off = rng.gen_range(0..=model.len());
                let mut buf = vec![0u8; rng.gen_range(1..40)];
                let n = f.read_at(&mut buf, off as i64).unwrap();
                let want = &model[off..(off + buf.len()).min(model.len())];
                assert_eq!(&buf[..n], want, "step {step}");
            }
        }
    }
    assert_eq!(fs.read_file("f").unwrap(), model);

    let loaded = reload(&fs, &store);
    assert_eq!(loaded.read_file("f").unwrap(), model);
}

#[test]
fn test_truncate_grows_with_zeros() {
    let (fs, _store) = empty_fs(small_blocks());
    let mut f = fs.create("f").unwrap();
    f.write(b"abc").unwrap();
    fs.flush("", true).unwrap();
    f.truncate(21).unwrap();
    let mut want = b"abc".to_vec();
    want.resize(21, 0);
    assert_eq!(fs.read_file("f").unwrap(), want);

    f.truncate(2).unwrap();
    f.truncate(4).unwrap();
    assert_eq!(fs.read_file("f").unwrap(), b"ab\0\0");
}

#[test]
fn test_seek_past_end_then_write() {
    let (fs, _store) = empty_fs(FsConfig::default());
    let mut f = fs.create("sparse").unwrap();
    assert_eq!(f.seek(SeekFrom::Start(10)).unwrap(), 10);
    assert_eq!(f.stat().unwrap().size, 0);
    f.write(b"x").unwrap();
    let mut want = vec![0u8; 10];
    want.push(b'x');
    assert_eq!(fs.read_file("sparse").unwrap(), want);
    assert_eq!(f.seek(SeekFrom::End(-11)).unwrap(), 0);
    assert_eq!(f.seek(SeekFrom::Current(-1)).unwrap_err().kind(), ErrorKind::NegativeOffset);
    assert_eq!(f.position(), 0);
}

#[test]
fn test_full_blocks_are_written_eagerly() {
    let (fs, store) = empty_fs(small_blocks());
    let data: Vec<u8> = (0..64).collect();
    fs.write_file("f", &data).unwrap();
    assert_eq!(store.write_count(), 8);
    // Only bookkeeping remains in memory.
    let flushed_memory = fs.memory_size();

    fs.sync().unwrap();
    assert_eq!(store.write_count(), 8);
    assert_eq!(fs.memory_size(), flushed_memory);
    let manifest = fs.marshal_manifest(".").unwrap();
    let locators = manifest.split(' ').filter(|tok| tok.contains('+')).count();
    assert_eq!(locators, 8);
    assert!(manifest.ends_with(" 0:64:f\n"));
    assert_eq!(fs.read_file("f").unwrap(), data);
}

#[test]
fn test_removed_and_renamed_trees_leave_manifest() {
    let (fs, store) = foo_and_bar(FsConfig::default());
    fs.mkdir("dir2", 0).unwrap();
    fs.write_file("dir2/new", b"new").unwrap();
    fs.rename("dir1", "dir2/moved").unwrap();
    fs.remove_all("dir2/new").unwrap();
    assert_eq!(
        fs.marshal_manifest(".").unwrap(),
        "./dir2/moved 3858f62230ac3c915f300c664312c63f+6 3:3:bar 0:3:foo\n"
    );
    let loaded = reload(&fs, &store);
    assert_eq!(loaded.read_file("dir2/moved/bar").unwrap(), b"bar");
}

#[test]
fn test_concurrent_writers_on_separate_files() {
    let (fs, store) = empty_fs(small_blocks());
    fs.mkdir("d", 0).unwrap();
    std::thread::scope(|s| {
        for i in 0..8u8 {
            let fs = fs.clone();
            s.spawn(move || {
                let mut f = fs.create(&format!("d/f{i}")).unwrap();
                for _ in 0..50 {
                    f.write(&[i; 3]).unwrap();
                }
                if i % 2 == 0 {
                    fs.flush("d", false).unwrap();
                }
            });
        }
        let fs = fs.clone();
        s.spawn(move || {
            for _ in 0..20 {
                fs.marshal_manifest(".").unwrap();
            }
        });
    });
    for i in 0..8u8 {
        assert_eq!(fs.read_file(&format!("d/f{i}")).unwrap(), vec![i; 150]);
    }
    let loaded = reload(&fs, &store);
    for i in 0..8u8 {
        assert_eq!(loaded.read_file(&format!("d/f{i}")).unwrap(), vec![i; 150]);
    }
}

#[test]
fn test_concurrent_writers_on_one_file() {
    let (fs, _store) = empty_fs(small_blocks());
    let mut f = fs.create("shared").unwrap();
    f.truncate(8 * 40).unwrap();
    std::thread::scope(|s| {
        for i in 0..8u8 {
            let fs = fs.clone();
            s.spawn(move || {
                let f = fs.open_file("shared", OpenFlags::write(), 0).unwrap();
                for j in 0..40i64 {
                    f.write_at(&[i + 1], j * 8 + i as i64).unwrap();
                }
            });
        }
    });
    let data = fs.read_file("shared").unwrap();
    assert_eq!(data.len(), 320);
    for (off, byte) in data.iter().enumerate() {
        assert_eq!(*byte as usize, off % 8 + 1, "offset {off}");
    }
}

#[test]
fn test_concurrent_renames_do_not_deadlock() {
    let (fs, _store) = empty_fs(FsConfig::default());
    for d in ["a", "b", "a/x", "b/y"] {
        fs.mkdir(d, 0).unwrap();
    }
    std::thread::scope(|s| {
        for t in 0..4 {
            let fs = fs.clone();
            s.spawn(move || {
                let name = format!("file{t}");
                fs.write_file(&format!("a/x/{name}"), b"data").unwrap();
                for _ in 0..50 {
                    fs.rename(&format!("a/x/{name}"), &format!("b/y/{name}")).unwrap();
                    fs.rename(&format!("b/y/{name}"), &format!("a/x/{name}")).unwrap();
                }
            });
        }
        let fs = fs.clone();
        s.spawn(move || {
            for _ in 0..50 {
                // Moving a directory into its own subtree is always refused.
                let err = fs.rename("a", "a/x/a").unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidArgument);
                fs.read_dir("a/x").unwrap();
            }
        });
    });
    assert_eq!(fs.read_dir("a/x").unwrap().len(), 4);
    assert!(fs.read_dir("b/y").unwrap().is_empty());
}
