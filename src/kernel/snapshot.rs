//! Session snapshots: persist the kernel namespace across host restarts.
//!
//! One snapshot file per session, where the session id is derived from the
//! working directory. Saves happen on a periodic timer and at graceful
//! shutdown; restore happens once, before the first tool dispatch after a
//! lazy kernel start. Writes are write-temp-then-rename so a crash never
//! leaves a torn snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::BridgeResult;

use super::client::KernelClient;
use super::manager::KernelManager;

pub const SCHEMA_VERSION: u32 = 1;

/// Deterministic session id from a working directory path.
pub fn session_id_for(working_dir: &Path) -> String {
    let digest = Sha256::digest(working_dir.to_string_lossy().as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

/// Sidecar metadata written next to each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub schema_version: u32,
}

pub struct SessionSnapshotter {
    session_id: String,
    dir: PathBuf,
    expiry_days: u64,
}

impl SessionSnapshotter {
    pub fn new(dir: PathBuf, session_id: String, expiry_days: u64) -> Self {
        Self {
            session_id,
            dir,
            expiry_days,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(format!("{}.snapshot", self.session_id))
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(format!("{}.manifest.json", self.session_id))
    }

    /// Ask the kernel for its namespace and persist it atomically.
    pub async fn save(&self, client: &KernelClient) -> BridgeResult<()> {
        let bytes = client.snapshot_save().await?;
        if bytes.is_empty() {
            warn!(session = %self.session_id, "kernel returned an empty snapshot, keeping previous");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.snapshot_path();
        let tmp = path.with_extension("snapshot.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let manifest = SnapshotManifest {
            session_id: self.session_id.clone(),
            saved_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
        };
        tokio::fs::write(self.manifest_path(), serde_json::to_vec_pretty(&manifest)?).await?;
        info!(session = %self.session_id, bytes = bytes.len(), "session snapshot saved");
        Ok(())
    }

    /// Push a persisted snapshot into the kernel, if one exists and is fresh.
    ///
    /// Returns `true` when the kernel accepted the snapshot. Corrupt
    /// snapshots are renamed aside and the kernel starts clean; expired ones
    /// are deleted.
    pub async fn restore(&self, client: &KernelClient) -> BridgeResult<bool> {
        let path = self.snapshot_path();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }

        if self.is_expired(&path).await {
            info!(session = %self.session_id, "snapshot expired, starting fresh");
            let _ = tokio::fs::remove_file(&path).await;
            let _ = tokio::fs::remove_file(self.manifest_path()).await;
            return Ok(false);
        }

        let bytes = tokio::fs::read(&path).await?;
        match client.snapshot_restore(bytes).await {
            Ok(report) => {
                info!(
                    session = %self.session_id,
                    restored = report.restored.len(),
                    skipped = report.skipped.len(),
                    "session snapshot restored"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "snapshot rejected, moving aside");
                let aside = path.with_extension("snapshot.corrupt");
                let _ = tokio::fs::rename(&path, &aside).await;
                let _ = tokio::fs::remove_file(self.manifest_path()).await;
                Ok(false)
            }
        }
    }

    async fn is_expired(&self, path: &Path) -> bool {
        let cutoff = Duration::from_secs(self.expiry_days * 86_400);
        // Prefer the manifest timestamp; fall back to file mtime.
        if let Ok(raw) = tokio::fs::read_to_string(self.manifest_path()).await {
            if let Ok(manifest) = serde_json::from_str::<SnapshotManifest>(&raw) {
                let age = Utc::now().signed_duration_since(manifest.saved_at);
                return age.num_seconds() > cutoff.as_secs() as i64;
            }
        }
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified.elapsed().map(|e| e > cutoff).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Remove snapshots (any session) older than the expiry window.
    pub async fn cleanup_expired(&self) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        let cutoff = Duration::from_secs(self.expiry_days * 86_400);
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("snapshot") {
                continue;
            }
            let stale = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > cutoff);
            if stale && tokio::fs::remove_file(&path).await.is_ok() {
                let _ = tokio::fs::remove_file(path.with_extension("manifest.json")).await;
                removed += 1;
            }
        }
        removed
    }

    /// Background auto-save loop. Saves are gated on `exec_gate` so a save
    /// never overlaps an in-flight execute, and skipped entirely while the
    /// kernel has not started.
    pub fn spawn_periodic(
        self: Arc<Self>,
        manager: Arc<KernelManager>,
        exec_gate: Arc<Mutex<()>>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if manager.current_tier().await.is_none() {
                    continue;
                }
                let _gate = exec_gate.lock().await;
                if let Err(e) = self.save(manager.client()).await {
                    warn!(error = %e, "periodic snapshot save failed");
                }
            }
        })
    }
}
