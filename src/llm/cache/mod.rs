// Process-lifetime caches
// Entries are never evicted: a new content hash supersedes the old key


use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{PoisonError, RwLock};

/// A concurrent string-keyed map shared by the tasks of one process.
#[derive(Debug, Default)]
pub struct HashCache<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V: Clone> HashCache<V> {
    #[inline]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    #[inline]
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    #[inline]
    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hypothetical snippets keyed by [`patch_hash`]
pub type SnippetCache = HashCache<String>;

/// Directory path to the content hash its stored summary was generated from
pub type SummaryCache = HashCache<String>;

/// First 8 bytes of the SHA-256 of a diff, hex encoded
#[inline]
pub fn patch_hash(patch: &str) -> String {
    short_hash(patch.as_bytes())
}

/// First 8 bytes of a SHA-256 digest, hex encoded
#[inline]
pub fn short_hash(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .take(8)
        .fold(String::with_capacity(16), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}
