//! In-process BM25 postings index over chunks.

use std::collections::HashMap;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Lowercased alphanumeric tokens, minimum two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// BM25 index keyed by sequential chunk ids.
#[derive(Debug, Default)]
pub struct LexicalIndex {
    postings: HashMap<String, Vec<(u32, u32)>>,
    chunk_lens: Vec<u32>,
    total_len: u64,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index one chunk. Ids must be inserted in increasing order.
    pub fn insert(&mut self, chunk_id: u32, text: &str) {
        let tokens = tokenize(text);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for t in &tokens {
            *counts.entry(t.clone()).or_insert(0) += 1;
        }
        for (token, tf) in counts {
            self.postings.entry(token).or_default().push((chunk_id, tf));
        }
        let len = tokens.len() as u32;
        if self.chunk_lens.len() <= chunk_id as usize {
            self.chunk_lens.resize(chunk_id as usize + 1, 0);
        }
        self.chunk_lens[chunk_id as usize] = len;
        self.total_len += len as u64;
    }

    pub fn len(&self) -> usize {
        self.chunk_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_lens.is_empty()
    }

    /// Rank chunks by BM25 against the query. Returns `(chunk_id, score)`
    /// sorted descending, at most `top_k` entries, zero-score chunks omitted.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(u32, f32)> {
        let n = self.chunk_lens.len();
        if n == 0 {
            return Vec::new();
        }
        let avg_len = (self.total_len as f32 / n as f32).max(1.0);

        let mut scores: HashMap<u32, f32> = HashMap::new();
        for token in tokenize(query) {
            let Some(posting) = self.postings.get(&token) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = (((n as f32 - df + 0.5) / (df + 0.5)) + 1.0).ln();
            for &(chunk_id, tf) in posting {
                let len = self.chunk_lens[chunk_id as usize] as f32;
                let tf = tf as f32;
                let score = idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * len / avg_len));
                *scores.entry(chunk_id).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(u32, f32)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(top_k);
        ranked
    }
}
