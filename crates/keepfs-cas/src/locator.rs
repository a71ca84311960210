//! Block locators: `hash+size[+hint...]`.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};

use crate::error::{CasError, CasResult};

/// Locator of the zero-length block.
pub const EMPTY_BLOCK_LOCATOR: &str = "d41d8cd98f00b204e9800998ecf8427e+0";

const HASH_LEN: usize = 32;

/// Identifies an immutable block: md5 content hash, declared size, and
/// any trailing hints (permission signatures, storage hints).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    hash: String,
    size: u64,
    hints: Vec<String>,
}

impl Locator {
    /// Build a locator from a hex hash and size, without hints.
    pub fn new(hash: impl Into<String>, size: u64) -> CasResult<Self> {
        let hash = hash.into();
        if !is_md5_hex(&hash) {
            return Err(CasError::invalid_locator(hash));
        }
        Ok(Self {
            hash,
            size,
            hints: Vec::new(),
        })
    }

    /// Compute the locator for a block's content.
    pub fn for_data(data: &[u8]) -> Self {
        Self {
            hash: hex::encode(Md5::digest(data)),
            size: data.len() as u64,
            hints: Vec::new(),
        }
    }

    /// The zero-length block.
    pub fn empty() -> Self {
        Self::for_data(&[])
    }

    /// Lowercase hex md5 of the block content.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Declared block size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hints(&self) -> &[String] {
        &self.hints
    }

    /// Same block, hints removed.
    pub fn stripped(&self) -> Self {
        Self {
            hash: self.hash.clone(),
            size: self.size,
            hints: Vec::new(),
        }
    }

    /// Returns true if `self` and `other` name the same block, ignoring hints.
    pub fn same_block(&self, other: &Locator) -> bool {
        self.hash == other.hash && self.size == other.size
    }
}

impl FromStr for Locator {
    type Err = CasError;

    fn from_str(s: &str) -> CasResult<Self> {
        let mut parts = s.split('+');
        let hash = parts.next().unwrap_or_default();
        if !is_md5_hex(hash) {
            return Err(CasError::invalid_locator(s));
        }
        // Sizes are bounded to a signed 32-bit value on the wire.
        let size = match parts.next().map(str::parse::<i32>) {
            Some(Ok(n)) if n >= 0 => n as u64,
            _ => return Err(CasError::invalid_locator(s)),
        };
        let hints = parts.map(str::to_owned).collect::<Vec<_>>();
        if hints.iter().any(String::is_empty) {
            return Err(CasError::invalid_locator(s));
        }
        Ok(Self {
            hash: hash.to_owned(),
            size,
            hints,
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.hash, self.size)?;
        for hint in &self.hints {
            write!(f, "+{hint}")?;
        }
        Ok(())
    }
}

fn is_md5_hex(s: &str) -> bool {
    s.len() == HASH_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Content hash of a manifest, as used to identify a collection version.
///
/// Hints are stripped from every block locator before hashing, so signed
/// and unsigned copies of the same manifest hash identically.
pub fn portable_data_hash(manifest: &str) -> String {
    let mut stripped = String::with_capacity(manifest.len());
    for line in manifest.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        for (i, token) in body.split(' ').enumerate() {
            if i > 0 {
                stripped.push(' ');
            }
            match token.parse::<Locator>() {
                Ok(loc) if i > 0 => stripped.push_str(&loc.stripped().to_string()),
                _ => stripped.push_str(token),
            }
        }
        stripped.push_str(newline);
    }
    format!("{}+{}", hex::encode(Md5::digest(stripped.as_bytes())), stripped.len())
}
