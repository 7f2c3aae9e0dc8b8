//! 64-bit simhash for near-duplicate detection across chunks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::lexical::tokenize;

/// Hamming distance at or below which two chunks count as near-duplicates.
pub const NEAR_DUP_DISTANCE: u32 = 3;

/// Weighted 64-bit simhash over the token bag.
pub fn simhash64(text: &str) -> u64 {
    let mut weights = [0i32; 64];
    for token in tokenize(text) {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let h = hasher.finish();
        for (bit, w) in weights.iter_mut().enumerate() {
            if h & (1 << bit) != 0 {
                *w += 1;
            } else {
                *w -= 1;
            }
        }
    }
    let mut hash = 0u64;
    for (bit, w) in weights.iter().enumerate() {
        if *w > 0 {
            hash |= 1 << bit;
        }
    }
    hash
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Near-duplicate sub-index keyed by sequential chunk ids.
#[derive(Default)]
pub struct SimhashIndex {
    hashes: Vec<u64>,
}

impl SimhashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk_id: u32, hash: u64) {
        if self.hashes.len() <= chunk_id as usize {
            self.hashes.resize(chunk_id as usize + 1, 0);
        }
        self.hashes[chunk_id as usize] = hash;
    }

    pub fn get(&self, chunk_id: u32) -> Option<u64> {
        self.hashes.get(chunk_id as usize).copied()
    }

    /// Chunk ids whose hash is within `max_distance` of `hash`.
    pub fn near(&self, hash: u64, max_distance: u32) -> Vec<u32> {
        self.hashes
            .iter()
            .enumerate()
            .filter(|(_, h)| **h != 0 && hamming(hash, **h) <= max_distance)
            .map(|(id, _)| id as u32)
            .collect()
    }
}
