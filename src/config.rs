//! Configuration layer: JSON file with defaults, plus environment overrides.
//!
//! Every field has a default so the host starts with no config file at all.
//! The model credential is read from `ANTHROPIC_API_KEY` at request time and
//! never lands in any persisted artifact.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Environment variable that replaces the blocked-domain list (comma-separated).
pub const BLOCKED_DOMAINS_ENV: &str = "TOOLBRIDGE_BLOCKED_DOMAINS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kernel: KernelConfig,
    pub callback: CallbackConfig,
    pub storage: StorageConfig,
    pub fetch: FetchConfig,
    pub models: ModelConfig,
    pub snapshot: SnapshotConfig,
    /// Default for `ask`: return raw chunks with citations (true) or compose
    /// an answer with the sub-model (false).
    pub ask_context_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            callback: CallbackConfig::default(),
            storage: StorageConfig::default(),
            fetch: FetchConfig::default(),
            models: ModelConfig::default(),
            snapshot: SnapshotConfig::default(),
            ask_context_only: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Attach to an already-running kernel instead of owning one.
    pub url: Option<String>,
    /// Requested isolation tier: 1 = bare subprocess, 2 = container, 3 = reserved.
    pub tier: u8,
    pub image: String,
    pub container_name: String,
    pub port: u16,
    /// Kernel-side execution timeout for a single code cell.
    pub exec_timeout_secs: u64,
    /// Command used for the Tier 1 bare kernel subprocess.
    pub bare_command: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            url: None,
            tier: 2,
            image: "toolbridge-kernel".into(),
            container_name: "toolbridge-kernel".into(),
            port: 8080,
            exec_timeout_secs: 30,
            bare_command: vec![
                "uvicorn".into(),
                "sandbox.server:app".into(),
                "--host".into(),
                "127.0.0.1".into(),
                "--port".into(),
                "8080".into(),
            ],
        }
    }
}

impl KernelConfig {
    pub fn base_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub port: u16,
    /// Hostname the containerized kernel uses to reach the host.
    pub container_host: String,
    pub body_limit_bytes: usize,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            container_host: "host.docker.internal".into(),
            body_limit_bytes: 1024 * 1024,
        }
    }
}

impl CallbackConfig {
    /// Base URL for a bare-subprocess kernel (everything on loopback).
    pub fn local_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Base URL injected into a containerized kernel.
    pub fn container_base_url(&self) -> String {
        format!("http://{}:{}", self.container_host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for all persisted state; defaults to `~/.toolbridge`.
    pub base_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn root(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".toolbridge")
        })
    }

    /// Per-project index files live here: `knowledge/<project_id>.seg` (+ .wal).
    pub fn knowledge_dir(&self) -> PathBuf {
        self.root().join("knowledge")
    }

    /// Raw fetched markdown: `knowledge/<project_id>/raw/...`.
    pub fn raw_docs_dir(&self, project_id: &str) -> PathBuf {
        self.root().join("knowledge").join(project_id).join("raw")
    }

    /// Kernel snapshots: `sessions/<session_id>.snapshot`.
    pub fn sessions_dir(&self) -> PathBuf {
        self.root().join("sessions")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub freshness_days: u64,
    pub proxy_base: String,
    pub blocked_domains: Vec<String>,
    pub request_timeout_secs: u64,
    /// Pacing delay between sitemap page fetches.
    pub sitemap_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            freshness_days: 7,
            proxy_base: "https://markdown.new".into(),
            blocked_domains: vec!["medium.com".into(), "substack.com".into()],
            request_timeout_secs: 15,
            sitemap_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub main_model: String,
    pub sub_model: String,
    pub api_base: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            main_model: "claude-sonnet-4-5-20250929".into(),
            sub_model: "claude-haiku-4-5-20251001".into(),
            api_base: "https://api.anthropic.com".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub interval_secs: u64,
    pub expiry_days: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            expiry_days: 7,
        }
    }
}

impl Config {
    /// Load from a JSON file, or defaults when `path` is `None`.
    /// Environment overrides are applied in both cases.
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    BridgeError::Validation(format!("cannot read config {}: {e}", p.display()))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    BridgeError::Validation(format!("malformed config {}: {e}", p.display()))
                })?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var(BLOCKED_DOMAINS_ENV) {
            self.fetch.blocked_domains = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}
