//! Dense-vector sub-index with a pluggable embedder.
//!
//! The default embedder is a hashed bag-of-words projection: stateless, so
//! embeddings stay comparable as the corpus grows, and dependency-free. A
//! model-backed embedder plugs in through the same trait.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::lexical::tokenize;

/// Capability contract for turning text into a fixed-size vector.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashed term-frequency embedder with sublinear weighting and L2
/// normalization.
pub struct HashedEmbedder {
    dim: usize,
}

impl HashedEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

impl Embedder for HashedEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dim as u64) as usize;
            // Sign bit decorrelates colliding tokens.
            let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        for v in vector.iter_mut() {
            *v = v.signum() * (1.0 + v.abs()).ln();
        }
        normalize(&mut vector);
        vector
    }
}

fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in vector.iter_mut() {
            *v /= magnitude;
        }
    }
}

/// Cosine similarity over pre-normalized vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Vector index keyed by sequential chunk ids.
#[derive(Default)]
pub struct VectorIndex {
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk_id: u32, vector: Vec<f32>) {
        if self.vectors.len() <= chunk_id as usize {
            self.vectors.resize(chunk_id as usize + 1, Vec::new());
        }
        self.vectors[chunk_id as usize] = vector;
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Rank chunks by cosine similarity, descending, dropping non-positive
    /// scores.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<(u32, f32)> {
        let mut scored: Vec<(u32, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .map(|(id, v)| (id as u32, cosine(query, v)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_are_normalized() {
        let embedder = HashedEmbedder::default();
        let v = embedder.embed("some text with several distinct tokens");
        let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-5);
    }

    #[test]
    fn identical_text_embeds_identically() {
        let embedder = HashedEmbedder::default();
        assert_eq!(embedder.embed("alpha beta"), embedder.embed("alpha beta"));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let embedder = HashedEmbedder::default();
        let v = embedder.embed("");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn similar_text_scores_higher_than_unrelated() {
        let embedder = HashedEmbedder::default();
        let query = embedder.embed("tokio async runtime scheduling");
        let close = embedder.embed("the tokio runtime schedules async tasks");
        let far = embedder.embed("sourdough bread hydration ratios");
        assert!(cosine(&query, &close) > cosine(&query, &far));
    }

    #[test]
    fn index_ranks_most_similar_first() {
        let embedder = HashedEmbedder::default();
        let mut index = VectorIndex::new();
        index.insert(0, embedder.embed("rust ownership and borrowing rules"));
        index.insert(1, embedder.embed("gardening tips for tomato plants"));
        index.insert(2, embedder.embed("ownership moves and borrows in rust"));

        let hits = index.search(&embedder.embed("rust borrowing"), 2);
        assert!(!hits.is_empty());
        assert!(hits[0].0 == 0 || hits[0].0 == 2);
    }

    #[test]
    fn sparse_ids_leave_gaps_unscored() {
        let embedder = HashedEmbedder::default();
        let mut index = VectorIndex::new();
        index.insert(5, embedder.embed("only entry"));
        let hits = index.search(&embedder.embed("only entry"), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 5);
    }
}
