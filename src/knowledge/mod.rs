//! Per-project persistent knowledge index with hybrid retrieval.
//!
//! A project owns exactly one segment file (plus WAL) and one raw-document
//! directory. Projects are created lazily on first write and cached for the
//! life of the host process.

pub mod chunker;
pub mod lexical;
pub mod segment;
pub mod simhash;
pub mod store;
pub mod vector;

pub use store::{
    AskOutcome, Hit, IngestReport, IngestRequest, KnowledgeStore, SearchMode, StoreStatus,
    TimelineEntry,
};
pub use vector::{Embedder, HashedEmbedder};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::BridgeResult;

/// Deterministic project id from a working directory path or topic slug.
pub fn project_id_for(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let mut hex = String::with_capacity(16);
    for b in digest.iter().take(8) {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

/// Process-wide cache of open stores, one per project id.
///
/// Reads hit the map lock-free; first-time opens serialize on `open_gate` so
/// a project never gets two live store instances.
pub struct ProjectStores {
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    stores: DashMap<String, Arc<KnowledgeStore>>,
    open_gate: Mutex<()>,
}

impl ProjectStores {
    pub fn new(dir: PathBuf, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            dir,
            embedder,
            stores: DashMap::new(),
            open_gate: Mutex::new(()),
        }
    }

    /// Get the open store for a project, opening it on first access.
    pub async fn get(&self, project_id: &str) -> BridgeResult<Arc<KnowledgeStore>> {
        if let Some(store) = self.stores.get(project_id) {
            return Ok(Arc::clone(&store));
        }
        let _opening = self.open_gate.lock().await;
        if let Some(store) = self.stores.get(project_id) {
            return Ok(Arc::clone(&store));
        }
        let store = Arc::new(
            KnowledgeStore::open(&self.dir, project_id, Arc::clone(&self.embedder)).await?,
        );
        self.stores.insert(project_id.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Clear a project's index and drop it from the cache.
    pub async fn clear(&self, project_id: &str) -> BridgeResult<()> {
        let store = self.get(project_id).await?;
        store.clear().await?;
        self.stores.remove(project_id);
        Ok(())
    }

    /// Compact and release every open store.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, store)) = self.stores.remove(&id) {
                if let Err(e) = store.close().await {
                    warn!(project = %id, error = %e, "failed to close knowledge store");
                }
            }
        }
    }
}
