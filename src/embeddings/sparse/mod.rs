// Sparse lexical vectors for hybrid search
// Terms are hashed into a fixed space; weights are log term frequency, L2 normalized


use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Size of the hashed term space
const SPARSE_DIMENSIONS: u32 = 1 << 20;
const MIN_TERM_LEN: usize = 2;
const MAX_TERM_LEN: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    /// Sorted, unique term slots
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Dot product of two sorted sparse vectors
    #[inline]
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j) = (0, 0);
        let mut sum = 0.0;
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    sum += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }
}

/// Encode text into a sparse term vector.
///
/// Identifiers are split on non-alphanumeric characters and on camelCase
/// boundaries; both the whole identifier and its parts are counted.
#[inline]
pub fn encode(text: &str) -> SparseVector {
    let mut counts: BTreeMap<u32, f32> = BTreeMap::new();

    for term in terms(text) {
        *counts.entry(term_slot(&term)).or_insert(0.0) += 1.0;
    }

    if counts.is_empty() {
        return SparseVector::default();
    }

    let weighted: Vec<(u32, f32)> = counts
        .into_iter()
        .map(|(slot, tf)| (slot, 1.0 + tf.ln()))
        .collect();
    let norm = weighted.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();

    let (indices, values) = weighted
        .into_iter()
        .map(|(slot, weight)| (slot, weight / norm))
        .unzip();

    SparseVector { indices, values }
}

fn term_slot(term: &str) -> u32 {
    let digest = Sha256::digest(term.as_bytes());
    let raw = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    raw % SPARSE_DIMENSIONS
}

fn terms(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if word.len() < MIN_TERM_LEN || word.len() > MAX_TERM_LEN {
            continue;
        }
        let lowered = word.to_lowercase();

        let parts = split_identifier(word);
        if parts.len() > 1 {
            out.extend(
                parts
                    .into_iter()
                    .filter(|part| part.len() >= MIN_TERM_LEN)
                    .map(|part| part.to_lowercase()),
            );
        }
        out.push(lowered);
    }
    out
}

/// Split `fooBarBaz` and `foo_bar_baz` into their words
fn split_identifier(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in word.chars() {
        if c == '_' {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
