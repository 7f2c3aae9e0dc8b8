//! Per-project knowledge store: ingest, hybrid search, Q&A, timeline.
//!
//! One writer at a time per project (the write gate); readers overlap the
//! writer and may miss in-flight chunks. Persistence goes through the
//! segment + WAL pair in [`super::segment`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult};
use crate::lm::LanguageModel;

use super::chunker::chunk_text;
use super::lexical::{tokenize, LexicalIndex};
use super::segment::{
    Segment, SegmentFile, StoredChunk, StoredDoc, WalRecord, SEGMENT_SCHEMA_VERSION,
};
use super::simhash::{simhash64, SimhashIndex, NEAR_DUP_DISTANCE};
use super::vector::{Embedder, VectorIndex};

const RRF_K: f32 = 60.0;
const CANDIDATE_MULTIPLIER: usize = 4;
const COMPACT_WAL_THRESHOLD: usize = 64;
const LABEL_PRIOR_BOOST: f32 = 1.2;
const KEYWORD_BOOST: f32 = 1.1;
const RECENCY_BOOST: f32 = 0.15;
const ASK_TOP_K: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Vector,
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lexical" | "lex" => Ok(SearchMode::Lexical),
            "vector" | "vec" => Ok(SearchMode::Vector),
            "hybrid" | "auto" => Ok(SearchMode::Hybrid),
            other => Err(BridgeError::Validation(format!(
                "unknown search mode '{other}' (expected lexical, vector, or hybrid)"
            ))),
        }
    }
}

/// One ranked retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub title: String,
    pub label: String,
    pub text: String,
    pub score: f32,
    pub metadata: serde_json::Value,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub chunks: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub ingested_at: i64,
    pub title: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub doc_count: usize,
    pub chunk_count: usize,
    pub size_bytes: u64,
    pub labels: BTreeMap<String, usize>,
    pub threads: Vec<String>,
}

/// Result of `ask`: raw context chunks, optionally with a composed answer.
#[derive(Debug, Clone, Serialize)]
pub struct AskOutcome {
    pub answer: Option<String>,
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub title: String,
    pub label: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub thread: Option<String>,
}

impl IngestRequest {
    pub fn new(title: impl Into<String>, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            label: label.into(),
            text: text.into(),
            metadata: serde_json::Value::Null,
            thread: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_thread(mut self, thread: Option<String>) -> Self {
        self.thread = thread;
        self
    }
}

/// The five co-resident sub-indexes, rebuilt from the segment at open.
struct Indexes {
    segment: Segment,
    lexical: LexicalIndex,
    vectors: VectorIndex,
    simhash: SimhashIndex,
    /// (ingested_at, doc_id), kept sorted by timestamp.
    timeline: Vec<(i64, u64)>,
    /// Coarse keyword/entity index: identifier-ish terms to owning doc ids.
    keywords: HashMap<String, HashSet<u64>>,
    seen: HashSet<(String, String)>,
    doc_pos: HashMap<u64, usize>,
    next_doc_id: u64,
    wal_records: usize,
    /// False for segments written before ingestion timestamps existed.
    has_timeline: bool,
}

impl Indexes {
    fn empty() -> Self {
        Self {
            segment: Segment {
                schema_version: SEGMENT_SCHEMA_VERSION,
                ..Segment::default()
            },
            lexical: LexicalIndex::new(),
            vectors: VectorIndex::new(),
            simhash: SimhashIndex::new(),
            timeline: Vec::new(),
            keywords: HashMap::new(),
            seen: HashSet::new(),
            doc_pos: HashMap::new(),
            next_doc_id: 0,
            wal_records: 0,
            has_timeline: true,
        }
    }

    fn build(segment: Segment, wal_records: usize, embedder: &dyn Embedder) -> Self {
        let mut indexes = Self::empty();
        indexes.wal_records = wal_records;
        for doc in segment.docs {
            indexes.add_doc_entry(doc);
        }
        for chunk in segment.chunks {
            indexes.add_chunk_entry(chunk, embedder);
        }
        indexes.timeline.sort_unstable();
        indexes.has_timeline = indexes.segment.docs.is_empty()
            || indexes.segment.docs.iter().any(|d| d.ingested_at > 0);
        indexes
    }

    fn add_doc_entry(&mut self, doc: StoredDoc) {
        self.next_doc_id = self.next_doc_id.max(doc.id + 1);
        self.seen.insert((doc.label.clone(), doc.content_hash.clone()));
        if doc.ingested_at > 0 {
            self.timeline.push((doc.ingested_at, doc.id));
        }
        self.doc_pos.insert(doc.id, self.segment.docs.len());
        self.segment.docs.push(doc);
    }

    fn add_chunk_entry(&mut self, chunk: StoredChunk, embedder: &dyn Embedder) {
        let chunk_id = self.segment.chunks.len() as u32;
        self.lexical.insert(chunk_id, &chunk.text);
        self.vectors.insert(chunk_id, embedder.embed(&chunk.text));
        self.simhash.insert(chunk_id, simhash64(&chunk.text));
        for keyword in extract_keywords(&chunk.text) {
            self.keywords.entry(keyword).or_default().insert(chunk.doc_id);
        }
        self.segment.chunks.push(chunk);
    }

    fn doc_for_chunk(&self, chunk_id: u32) -> Option<(&StoredDoc, &StoredChunk)> {
        let chunk = self.segment.chunks.get(chunk_id as usize)?;
        let doc = self.segment.docs.get(*self.doc_pos.get(&chunk.doc_id)?)?;
        Some((doc, chunk))
    }

    fn avg_chunk_len(&self) -> f32 {
        if self.segment.chunks.is_empty() {
            return 1.0;
        }
        let total: usize = self.segment.chunks.iter().map(|c| c.text.len()).sum();
        (total as f32 / self.segment.chunks.len() as f32).max(1.0)
    }
}

/// Identifier-ish terms: capitalized words and snake_case/dotted names.
fn extract_keywords(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    for word in text.split_whitespace() {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '.');
        if word.len() < 3 {
            continue;
        }
        let first_upper = word.chars().next().is_some_and(|c| c.is_uppercase());
        if first_upper || word.contains('_') || word.matches('.').count() == 1 {
            out.insert(word.to_lowercase());
        }
    }
    out
}

fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut hex = String::with_capacity(64);
    for b in digest {
        hex.push_str(&format!("{b:02x}"));
    }
    format!("sha256:{hex}")
}

fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

pub struct KnowledgeStore {
    project_id: String,
    file: SegmentFile,
    embedder: Arc<dyn Embedder>,
    inner: RwLock<Indexes>,
    write_gate: Mutex<()>,
}

impl KnowledgeStore {
    /// Open (or create) the project's index, replaying any pending WAL.
    pub async fn open(
        dir: &Path,
        project_id: &str,
        embedder: Arc<dyn Embedder>,
    ) -> BridgeResult<Self> {
        let file = SegmentFile::new(dir, project_id);
        let (segment, wal_records) = file.load().await?;
        let indexes = Indexes::build(segment, wal_records, embedder.as_ref());
        info!(
            project = project_id,
            docs = indexes.segment.docs.len(),
            chunks = indexes.segment.chunks.len(),
            "knowledge store opened"
        );
        Ok(Self {
            project_id: project_id.to_string(),
            file,
            embedder,
            inner: RwLock::new(indexes),
            write_gate: Mutex::new(()),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Ingest one document. Duplicates (same `(label, content_hash)`) collapse
    /// into the existing document.
    pub async fn ingest(&self, request: IngestRequest) -> BridgeResult<IngestReport> {
        let _writer = self.write_gate.lock().await;
        let report = self.ingest_locked(request).await?;
        self.maybe_compact().await?;
        Ok(report)
    }

    /// Batched ingest with a single compaction check at the end. A failure
    /// mid-batch leaves previously ingested documents committed.
    pub async fn ingest_many(&self, requests: Vec<IngestRequest>) -> BridgeResult<Vec<IngestReport>> {
        let _writer = self.write_gate.lock().await;
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            reports.push(self.ingest_locked(request).await?);
        }
        self.maybe_compact().await?;
        Ok(reports)
    }

    async fn ingest_locked(&self, request: IngestRequest) -> BridgeResult<IngestReport> {
        let text = normalize_text(&request.text);
        if text.is_empty() {
            return Err(BridgeError::Validation(format!(
                "document '{}' has no content",
                request.title
            )));
        }
        let hash = content_hash(&text);

        {
            let inner = self.inner.read().await;
            if inner.seen.contains(&(request.label.clone(), hash.clone())) {
                debug!(title = %request.title, "duplicate document collapsed");
                return Ok(IngestReport {
                    chunks: 0,
                    deduplicated: true,
                });
            }
        }

        let pieces = chunk_text(&text);
        let doc_id = self.inner.read().await.next_doc_id;
        let doc = StoredDoc {
            id: doc_id,
            title: request.title,
            label: request.label,
            thread: request.thread,
            metadata: request.metadata,
            ingested_at: Utc::now().timestamp(),
            content_hash: hash,
        };
        let chunks: Vec<StoredChunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(chunk_index, text)| StoredChunk {
                doc_id,
                chunk_index,
                text,
            })
            .collect();
        let chunk_count = chunks.len();

        // Durable first: one WAL record carries the whole document.
        self.file
            .append(&WalRecord::AddDoc {
                doc: doc.clone(),
                chunks: chunks.clone(),
            })
            .await?;

        let mut inner = self.inner.write().await;
        inner.add_doc_entry(doc);
        for chunk in chunks {
            inner.add_chunk_entry(chunk, self.embedder.as_ref());
        }
        inner.timeline.sort_unstable();
        inner.wal_records += 1;

        Ok(IngestReport {
            chunks: chunk_count,
            deduplicated: false,
        })
    }

    async fn maybe_compact(&self) -> BridgeResult<()> {
        let inner = self.inner.read().await;
        if inner.wal_records < COMPACT_WAL_THRESHOLD {
            return Ok(());
        }
        self.file.compact(&inner.segment).await?;
        drop(inner);
        self.inner.write().await.wal_records = 0;
        Ok(())
    }

    /// Ranked retrieval. Thread and label filters are applied post-retrieval;
    /// near-duplicate hits are collapsed keeping the better-scored.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        mode: SearchMode,
        thread: Option<&str>,
        label: Option<&str>,
    ) -> Vec<Hit> {
        let inner = self.inner.read().await;
        let candidates = (top_k.max(1)) * CANDIDATE_MULTIPLIER;

        let scored: Vec<(u32, f32)> = match mode {
            SearchMode::Lexical => inner.lexical.search(query, candidates),
            SearchMode::Vector => inner
                .vectors
                .search(&self.embedder.embed(query), candidates),
            SearchMode::Hybrid => self.fuse(&inner, query, candidates),
        };

        let mut hits = Vec::new();
        let mut kept_hashes: Vec<u64> = Vec::new();
        for (chunk_id, score) in scored {
            let Some((doc, chunk)) = inner.doc_for_chunk(chunk_id) else {
                continue;
            };
            if let Some(t) = thread {
                if doc.thread.as_deref() != Some(t) {
                    continue;
                }
            }
            if let Some(l) = label {
                if doc.label != l {
                    continue;
                }
            }
            let hash = inner.simhash.get(chunk_id).unwrap_or(0);
            if hash != 0
                && kept_hashes
                    .iter()
                    .any(|kept| super::simhash::hamming(*kept, hash) <= NEAR_DUP_DISTANCE)
            {
                continue;
            }
            kept_hashes.push(hash);
            hits.push(Hit {
                title: doc.title.clone(),
                label: doc.label.clone(),
                text: chunk.text.clone(),
                score,
                metadata: doc.metadata.clone(),
                chunk_index: chunk.chunk_index,
            });
            if hits.len() >= top_k {
                break;
            }
        }
        hits
    }

    /// Reciprocal-rank fusion of the BM25 and cosine rankings, re-weighted by
    /// chunk-length normalization, a label prior, and the keyword index.
    fn fuse(&self, inner: &Indexes, query: &str, candidates: usize) -> Vec<(u32, f32)> {
        let lexical = inner.lexical.search(query, candidates);
        let vector = inner
            .vectors
            .search(&self.embedder.embed(query), candidates);

        let mut fused: HashMap<u32, f32> = HashMap::new();
        for ranking in [&lexical, &vector] {
            for (rank, (chunk_id, _)) in ranking.iter().enumerate() {
                *fused.entry(*chunk_id).or_insert(0.0) += 1.0 / (RRF_K + rank as f32 + 1.0);
            }
        }

        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        let avg_len = inner.avg_chunk_len();
        let mut scored: Vec<(u32, f32)> = fused
            .into_iter()
            .map(|(chunk_id, mut score)| {
                if let Some((doc, chunk)) = inner.doc_for_chunk(chunk_id) {
                    let len = chunk.text.len() as f32;
                    score *= 0.5 + len / (len + avg_len);
                    if query_tokens.contains(&doc.label.to_lowercase()) {
                        score *= LABEL_PRIOR_BOOST;
                    }
                    if query_tokens.iter().any(|t| {
                        inner
                            .keywords
                            .get(t)
                            .is_some_and(|docs| docs.contains(&doc.id))
                    }) {
                        score *= KEYWORD_BOOST;
                    }
                }
                (chunk_id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(candidates);
        scored
    }

    /// Retrieve context for a question, optionally composing an answer with
    /// the sub-model. Recency weighting applies only while the timeline
    /// sub-index exists; otherwise this degrades to plain `search`.
    pub async fn ask(
        &self,
        question: &str,
        context_only: bool,
        thread: Option<&str>,
        model: Option<&dyn LanguageModel>,
    ) -> BridgeResult<AskOutcome> {
        let mut hits = self
            .search(question, ASK_TOP_K, SearchMode::Hybrid, thread, None)
            .await;

        let inner = self.inner.read().await;
        if inner.has_timeline && !inner.timeline.is_empty() {
            let min_ts = inner.timeline.first().map(|(t, _)| *t).unwrap_or(0);
            let max_ts = inner.timeline.last().map(|(t, _)| *t).unwrap_or(0);
            let span = (max_ts - min_ts).max(1) as f32;
            let ts_by_title: HashMap<&str, i64> = inner
                .segment
                .docs
                .iter()
                .map(|d| (d.title.as_str(), d.ingested_at))
                .collect();
            for hit in hits.iter_mut() {
                if let Some(ts) = ts_by_title.get(hit.title.as_str()) {
                    let frac = (*ts - min_ts) as f32 / span;
                    hit.score *= 1.0 + RECENCY_BOOST * frac;
                }
            }
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        }
        drop(inner);

        if context_only {
            return Ok(AskOutcome { answer: None, hits });
        }
        let Some(model) = model else {
            return Ok(AskOutcome { answer: None, hits });
        };
        if hits.is_empty() {
            return Ok(AskOutcome {
                answer: Some("No relevant context found.".into()),
                hits,
            });
        }

        let mut prompt = String::from(
            "Answer the question using only the numbered context below. \
             Cite sources as [n].\n\n",
        );
        for (i, hit) in hits.iter().enumerate() {
            prompt.push_str(&format!("[{}] {} ({})\n{}\n\n", i + 1, hit.title, hit.label, hit.text));
        }
        prompt.push_str(&format!("Question: {question}\nAnswer:"));

        let completion = model.complete(&prompt).await?;
        Ok(AskOutcome {
            answer: Some(completion.text),
            hits,
        })
    }

    /// Titles in ingestion order, optionally bounded by unix timestamps.
    pub async fn timeline(
        &self,
        since: Option<i64>,
        until: Option<i64>,
        limit: usize,
    ) -> Vec<TimelineEntry> {
        let inner = self.inner.read().await;
        inner
            .timeline
            .iter()
            .filter(|(ts, _)| since.is_none_or(|s| *ts >= s) && until.is_none_or(|u| *ts <= u))
            .filter_map(|(ts, doc_id)| {
                let doc = inner.segment.docs.get(*inner.doc_pos.get(doc_id)?)?;
                Some(TimelineEntry {
                    ingested_at: *ts,
                    title: doc.title.clone(),
                    label: doc.label.clone(),
                })
            })
            .take(limit)
            .collect()
    }

    pub async fn status(&self) -> StoreStatus {
        let inner = self.inner.read().await;
        let mut labels: BTreeMap<String, usize> = BTreeMap::new();
        let mut threads: HashSet<String> = HashSet::new();
        for doc in &inner.segment.docs {
            *labels.entry(doc.label.clone()).or_insert(0) += 1;
            if let Some(t) = &doc.thread {
                threads.insert(t.clone());
            }
        }
        let mut threads: Vec<String> = threads.into_iter().collect();
        threads.sort();
        StoreStatus {
            doc_count: inner.segment.docs.len(),
            chunk_count: inner.segment.chunks.len(),
            size_bytes: self.file.size_bytes().await,
            labels,
            threads,
        }
    }

    /// Delete the index files and reset in-memory state. Idempotent.
    pub async fn clear(&self) -> BridgeResult<()> {
        let _writer = self.write_gate.lock().await;
        self.file.remove().await?;
        *self.inner.write().await = Indexes::empty();
        info!(project = %self.project_id, "knowledge store cleared");
        Ok(())
    }

    /// Fold outstanding WAL records into the segment.
    pub async fn close(&self) -> BridgeResult<()> {
        let _writer = self.write_gate.lock().await;
        let inner = self.inner.read().await;
        if inner.wal_records == 0 {
            return Ok(());
        }
        self.file.compact(&inner.segment).await?;
        drop(inner);
        self.inner.write().await.wal_records = 0;
        Ok(())
    }
}
