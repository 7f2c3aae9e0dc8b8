//! On-disk representation: one segment file per project plus a write-ahead
//! log for incremental commits.
//!
//! A commit appends one JSONL record per document to the WAL; compaction
//! folds the WAL into the segment with a write-temp-then-rename and truncates
//! it. Open loads the segment then replays the WAL, stopping at the first
//! torn line, so a crash mid-append loses at most the in-flight document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::BridgeResult;

pub const SEGMENT_SCHEMA_VERSION: u32 = 1;

/// An ingested document's durable metadata. Chunk text lives in
/// [`StoredChunk`] rows that point back at the owning document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDoc {
    pub id: u64,
    pub title: String,
    pub label: String,
    #[serde(default)]
    pub thread: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Unix seconds; 0 in segments written before the timeline existed.
    #[serde(default)]
    pub ingested_at: i64,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub doc_id: u64,
    pub chunk_index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Segment {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub docs: Vec<StoredDoc>,
    #[serde(default)]
    pub chunks: Vec<StoredChunk>,
}

/// One WAL line. A document and all its chunks travel in a single record, so
/// per-document ingest is all-or-nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalRecord {
    AddDoc {
        doc: StoredDoc,
        chunks: Vec<StoredChunk>,
    },
}

pub struct SegmentFile {
    seg_path: PathBuf,
    wal_path: PathBuf,
}

impl SegmentFile {
    pub fn new(dir: &Path, project_id: &str) -> Self {
        Self {
            seg_path: dir.join(format!("{project_id}.seg")),
            wal_path: dir.join(format!("{project_id}.wal")),
        }
    }

    pub fn exists(&self) -> bool {
        self.seg_path.exists() || self.wal_path.exists()
    }

    /// Load segment + WAL replay. Returns the materialized segment and the
    /// number of WAL records pending compaction.
    pub async fn load(&self) -> BridgeResult<(Segment, usize)> {
        let mut segment = match tokio::fs::read(&self.seg_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Segment {
                schema_version: SEGMENT_SCHEMA_VERSION,
                ..Segment::default()
            },
            Err(e) => return Err(e.into()),
        };

        let mut replayed = 0;
        if let Ok(raw) = tokio::fs::read_to_string(&self.wal_path).await {
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalRecord>(line) {
                    Ok(WalRecord::AddDoc { doc, chunks }) => {
                        segment.docs.push(doc);
                        segment.chunks.extend(chunks);
                        replayed += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "stopping WAL replay at torn record");
                        break;
                    }
                }
            }
        }
        Ok((segment, replayed))
    }

    /// Append one record to the WAL and sync it to disk.
    pub async fn append(&self, record: &WalRecord) -> BridgeResult<()> {
        if let Some(parent) = self.wal_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.wal_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Fold the materialized segment into the base file and truncate the WAL.
    pub async fn compact(&self, segment: &Segment) -> BridgeResult<()> {
        if let Some(parent) = self.seg_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.seg_path.with_extension("seg.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(segment)?).await?;
        tokio::fs::rename(&tmp, &self.seg_path).await?;
        match tokio::fs::remove_file(&self.wal_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete both files.
    pub async fn remove(&self) -> BridgeResult<()> {
        for path in [&self.seg_path, &self.wal_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn size_bytes(&self) -> u64 {
        let mut total = 0;
        for path in [&self.seg_path, &self.wal_path] {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                total += meta.len();
            }
        }
        total
    }
}
