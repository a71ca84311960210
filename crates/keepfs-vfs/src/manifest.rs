//! Manifest text codec.
//!
//! A manifest is one line per stream (directory):
//!
//! ```text
//! ./dir1 3858f62230ac3c915f300c664312c63f+6 3:3:bar 0:3:foo
//! ```
//!
//! The stream name is followed by block locators, then `offset:length:name`
//! file parts whose offsets index the concatenation of the stream's blocks.
//! Names escape whitespace, control bytes, `:` and `\` as `\OOO` octal.

use std::fmt::Write as _;
use std::string::FromUtf8Error;
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;

use keepfs_cas::{Locator, EMPTY_BLOCK_LOCATOR};
use regex::bytes::{Captures, Regex};
use tracing::debug;

use crate::error::{VfsError, VfsResult};
use crate::file::FileState;
use crate::flush::pack_files;
use crate::node::{check_name, replace_child, DirState, Node, NodeKind, NodeRef};
use crate::segment::{Segment, StoredSegment};

static UNESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\([0-7]{3}|\\)").expect("unescape pattern is valid"));

/// Escape a name or stream path for manifest text.
pub fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c <= ' ' || c == ':' || c == '\\' {
            let _ = write!(out, "\\{:03o}", c as u32);
        } else {
            out.push(c);
        }
    }
    out
}

/// Undo [`escape`]. `\\` decodes to a backslash; an octal escape that
/// does not fit in a byte is left as written.
///
/// Names are UTF-8. Escapes that decode to anything else are an error
/// rather than being rewritten.
pub fn unescape(text: &str) -> Result<String, FromUtf8Error> {
    if !text.contains('\\') {
        return Ok(text.to_owned());
    }
    let out = UNESCAPE.replace_all(text.as_bytes(), |caps: &Captures<'_>| -> Vec<u8> {
        let code = &caps[1];
        if code == b"\\" {
            return vec![b'\\'];
        }
        let value = code
            .iter()
            .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
        match u8::try_from(value) {
            Ok(byte) => vec![byte],
            Err(_) => caps[0].to_vec(),
        }
    });
    String::from_utf8(out.into_owned())
}

/// Populate the tree under `root` from manifest text.
///
/// Hints on block locators are dropped. Parsing stops at the first bad
/// line; nodes created by earlier lines remain.
pub(crate) fn load(root: &NodeRef, text: &str) -> VfsResult<()> {
    if text.is_empty() {
        return Ok(());
    }
    let Some(body) = text.strip_suffix('\n') else {
        return Err(VfsError::parse(text.split('\n').count(), "no trailing newline"));
    };
    let mut streams = 0;
    for (i, line) in body.split('\n').enumerate() {
        load_stream(root, i + 1, line)?;
        streams += 1;
    }
    debug!(streams, "loaded manifest");
    Ok(())
}

fn load_stream(root: &NodeRef, lineno: usize, line: &str) -> VfsResult<()> {
    let mut tokens = line.split(' ');
    let raw_stream_name = tokens.next().unwrap_or_default();
    let stream_name = unescape(raw_stream_name).map_err(|_| {
        VfsError::parse(lineno, format!("stream name {raw_stream_name:?} is not UTF-8"))
    })?;
    let stream_parts: Vec<&str> = stream_name.split('/').collect();

    let mut blocks: Vec<Locator> = Vec::new();
    let mut any_file = false;
    // Position in the stream of `blocks[block_idx]`, carried between file
    // parts since they usually arrive in stream order.
    let mut pos = 0usize;
    let mut block_idx = 0usize;

    for token in tokens {
        if !token.contains(':') {
            if any_file {
                return Err(VfsError::parse(lineno, format!("bad file segment {token:?}")));
            }
            let locator: Locator = token
                .parse()
                .map_err(|_| VfsError::parse(lineno, format!("bad locator {token:?}")))?;
            blocks.push(locator.stripped());
            continue;
        }
        if blocks.is_empty() {
            return Err(VfsError::parse(lineno, format!("bad locator {token:?}")));
        }
        let bad_segment = || VfsError::parse(lineno, format!("bad file segment {token:?}"));
        let mut fields = token.splitn(3, ':');
        let (Some(offset), Some(length), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(bad_segment());
        };
        let offset: usize = offset.parse().map_err(|_| bad_segment())?;
        let length: usize = length.parse().map_err(|_| bad_segment())?;
        let end = offset.checked_add(length).ok_or_else(bad_segment)?;
        any_file = true;

        let unescaped = unescape(name)
            .map_err(|_| VfsError::parse(lineno, format!("file name {name:?} is not UTF-8")))?;
        let mut path: Vec<&str> = stream_parts.clone();
        path.extend(unescaped.split('/'));
        let file = match create_file_and_parents(root, &path) {
            Ok(Some(file)) => file,
            // "<dir>/." with length zero marks an otherwise empty directory.
            Ok(None) if length == 0 => continue,
            Ok(None) => {
                return Err(VfsError::parse(
                    lineno,
                    format!("cannot use name {name:?} with length {length}"),
                ));
            }
            Err(e) => {
                return Err(VfsError::parse(
                    lineno,
                    format!("cannot use name {name:?} with length {length}: {e}"),
                ));
            }
        };
        let Some(lock) = file.file() else {
            return Err(VfsError::parse(lineno, format!("{name:?} is not a file")));
        };
        let mut state = lock.write();

        if pos > offset {
            pos = 0;
            block_idx = 0;
        }
        while block_idx < blocks.len() {
            let block = &blocks[block_idx];
            let block_len = block.size() as usize;
            let next = pos + block_len;
            if next <= offset || block_len == 0 {
                pos = next;
                block_idx += 1;
                continue;
            }
            if pos >= end {
                break;
            }
            let block_off = offset.saturating_sub(pos);
            let seg_len = (block_len - block_off).min(end - pos - block_off);
            state.append_segment(Segment::Stored(StoredSegment {
                locator: block.clone(),
                size: block_len,
                offset: block_off,
                length: seg_len,
            }));
            if next > end {
                break;
            }
            pos = next;
            block_idx += 1;
        }
        if block_idx == blocks.len() && pos < end {
            return Err(VfsError::parse(
                lineno,
                format!("invalid segment in {pos}-byte stream: {token:?}"),
            ));
        }
    }

    if !any_file {
        return Err(VfsError::parse(lineno, "no file segments"));
    }
    if blocks.is_empty() {
        return Err(VfsError::parse(lineno, "no locators"));
    }
    if stream_name.is_empty() {
        return Err(VfsError::parse(lineno, "no stream name"));
    }
    Ok(())
}

/// Find or create the file named by `names`, creating directories along
/// the way. Returns `None` when the last component is `.`, which only
/// asserts that the directory exists.
fn create_file_and_parents(root: &NodeRef, names: &[&str]) -> VfsResult<Option<NodeRef>> {
    let Some((basename, dirs)) = names.split_last() else {
        return Err(VfsError::invalid_argument("empty path"));
    };
    let core = Arc::clone(root.core());
    let mut node = Arc::clone(root);
    for &name in dirs {
        match name {
            "" | "." => continue,
            ".." => {
                if Arc::ptr_eq(&node, root) {
                    return Err(VfsError::invalid_argument("path escapes the collection"));
                }
                node = node.parent();
                continue;
            }
            _ => {}
        }
        let lock = node
            .dir()
            .ok_or_else(|| VfsError::not_a_directory(name))?;
        let next = replace_child(&node, &mut lock.write(), name, |child| match child {
            None => Ok(Some(Node::new_dir(&core, core.config.dir_perm, SystemTime::now()))),
            Some(child) if child.dir().is_some() => Ok(Some(child)),
            Some(_) => Err(VfsError::already_exists(name)),
        })?
        .ok_or_else(|| VfsError::not_found(name))?;
        node = next;
    }

    if *basename == "." {
        return Ok(None);
    }
    check_name(basename)?;
    let lock = node
        .dir()
        .ok_or_else(|| VfsError::not_a_directory(*basename))?;
    let file = replace_child(&node, &mut lock.write(), basename, |child| match child {
        None => Ok(Some(Node::new_file(
            &core,
            FileState::new(core.config.file_perm, SystemTime::now()),
        ))),
        Some(child) => match child.kind() {
            NodeKind::File(_) => Ok(Some(child)),
            NodeKind::Dir(_) => Err(VfsError::is_a_directory(*basename)),
            _ => Err(VfsError::invalid_argument(*basename)),
        },
    })?;
    Ok(file)
}

struct FilePart<'a> {
    name: &'a str,
    offset: usize,
    length: usize,
}

/// Serialize the subtree at `dir` under stream name `prefix`.
///
/// Files are flushed first (short blocks included) so every segment is
/// stored. The caller holds `dir`'s lock; child locks are taken here.
pub(crate) fn marshal_dir(dir: &NodeRef, state: &DirState, prefix: &str) -> VfsResult<String> {
    let core = dir.core();
    let mut subdirs: Vec<(&str, &NodeRef)> = Vec::new();
    let mut names: Vec<&str> = Vec::new();
    let mut files = Vec::new();
    for (name, child) in &state.children {
        if child.fs_id() != core.id {
            continue;
        }
        match child.kind() {
            NodeKind::Dir(_) => subdirs.push((name.as_str(), child)),
            NodeKind::File(lock) => {
                names.push(name);
                files.push(lock.write());
            }
            NodeKind::Generated(_) | NodeKind::Deferred(_) => {}
        }
    }

    if subdirs.is_empty() && files.is_empty() {
        if prefix == "." {
            return Ok(String::new());
        }
        return Ok(format!("{} {EMPTY_BLOCK_LOCATOR} 0:0:\\056\n", escape(prefix)));
    }

    pack_files(core.store.as_ref(), core.max_block_size(), &mut files, true)?;

    let mut blocks: Vec<String> = Vec::new();
    let mut parts: Vec<FilePart<'_>> = Vec::new();
    let mut stream_len = 0usize;
    for (&name, file) in names.iter().zip(&files) {
        if file.segments.is_empty() {
            parts.push(FilePart {
                name,
                offset: 0,
                length: 0,
            });
            continue;
        }
        for seg in &file.segments {
            let Segment::Stored(seg) = seg else {
                panic!("marshal_dir: {prefix}/{name} still has a memory segment after flush");
            };
            let locator = seg.locator.stripped().to_string();
            if blocks.last() == Some(&locator) {
                stream_len -= seg.size;
            } else {
                blocks.push(locator);
            }
            let offset = stream_len + seg.offset;
            match parts.last_mut() {
                Some(prev) if prev.name == name && prev.offset + prev.length == offset => {
                    prev.length += seg.length;
                }
                _ => parts.push(FilePart {
                    name,
                    offset,
                    length: seg.length,
                }),
            }
            stream_len += seg.size;
        }
    }
    drop(files);

    let mut text = String::new();
    if !parts.is_empty() {
        if blocks.is_empty() {
            blocks.push(EMPTY_BLOCK_LOCATOR.to_owned());
        }
        text.push_str(&escape(prefix));
        for block in &blocks {
            text.push(' ');
            text.push_str(block);
        }
        for part in &parts {
            let _ = write!(text, " {}:{}:{}", part.offset, part.length, escape(part.name));
        }
        text.push('\n');
    }
    for (name, sub) in subdirs {
        let Some(lock) = sub.dir() else { continue };
        let sub_state = lock.read();
        text.push_str(&marshal_dir(sub, &sub_state, &format!("{prefix}/{name}"))?);
    }
    Ok(text)
}
