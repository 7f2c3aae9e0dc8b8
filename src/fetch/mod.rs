//! Markdown acquisition with dual storage.
//!
//! A URL goes through a three-tier cascade (content negotiation, proxy,
//! local HTML conversion). The winning body is written verbatim under the
//! project's raw-document directory with a sidecar metadata file, and the
//! caller ingests it into the knowledge index. Fetch failures are structured
//! results, never raised errors, so batch composition keeps going.

pub mod markdown;
pub mod sitemap;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use crate::config::FetchConfig;
use crate::error::{BridgeError, BridgeResult};

use markdown::{html_to_markdown, is_htmlish, looks_like_markdown};

/// Header carrying a server-side token count for negotiated markdown.
const TOKENS_HEADER: &str = "x-markdown-tokens";

/// How the markdown for a URL was obtained.
pub mod sources {
    pub const NEGOTIATED: &str = "negotiated";
    pub const PROXY: &str = "markdown_new";
    pub const CONVERTED: &str = "html2text";
}

/// Sidecar metadata written next to every raw markdown file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMeta {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    pub size_bytes: usize,
    pub markdown_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    pub error_kind: String,
    pub message: String,
}

impl FetchFailure {
    fn from_error(err: &BridgeError) -> Self {
        Self {
            error_kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Structured result of a fetch. `error` is set instead of raising.
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub url: String,
    pub content: Option<String>,
    pub path: Option<PathBuf>,
    pub meta: Option<FetchMeta>,
    pub from_cache: bool,
    pub error: Option<FetchFailure>,
}

impl FetchOutcome {
    fn failed(url: &str, err: BridgeError) -> Self {
        Self {
            url: url.to_string(),
            content: None,
            path: None,
            meta: None,
            from_cache: false,
            error: Some(FetchFailure::from_error(&err)),
        }
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A local file picked up by `load_dir`.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub title: String,
    pub path: PathBuf,
    pub content: String,
}

/// Derive a library/project name from a URL's host (and path for GitHub).
pub fn extract_library_name(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return "unknown".into();
    };
    let host = parsed.host_str().unwrap_or("");

    if host == "github.com" || host == "raw.githubusercontent.com" {
        let parts: Vec<&str> = parsed
            .path()
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        return match parts.as_slice() {
            [org, repo, ..] => format!("{org}-{repo}"),
            [org] => (*org).to_string(),
            [] => "github".into(),
        };
    }

    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("docs."))
        .or_else(|| host.strip_prefix("api."))
        .or_else(|| host.strip_prefix("developer."))
        .unwrap_or(host);

    host.split('.')
        .find(|s| s.len() > 2 && !matches!(*s, "com" | "org" | "io" | "dev" | "net" | "co"))
        .map(String::from)
        .unwrap_or_else(|| host.replace('.', "-"))
}

/// Map a URL to its relative raw-cache path: `<library>/<url path>.md`.
pub fn url_to_relpath(url: &str) -> PathBuf {
    let library = extract_library_name(url);
    let path = Url::parse(url)
        .map(|u| u.path().trim_matches('/').to_string())
        .unwrap_or_default();
    let path = path
        .trim_end_matches(".html")
        .trim_end_matches(".htm")
        .trim_end_matches(".md")
        .to_string();
    let path = if path.is_empty() { "index".to_string() } else { path };
    PathBuf::from(library).join(format!("{path}.md"))
}

fn meta_path(doc_path: &Path) -> PathBuf {
    doc_path.with_extension("meta.json")
}

fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut hex = String::with_capacity(64);
    for b in digest {
        hex.push_str(&format!("{b:02x}"));
    }
    format!("sha256:{hex}")
}

pub struct Fetcher {
    http: reqwest::Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(http: reqwest::Client, config: FetchConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// The blocklist entry matching this URL's host, if any. Hosts are
    /// compared after stripping `www.` / `docs.` prefixes, by suffix.
    pub fn blocked_domain(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let host = host
            .strip_prefix("www.")
            .or_else(|| host.strip_prefix("docs."))
            .unwrap_or(host);
        self.config
            .blocked_domains
            .iter()
            .find(|d| host == d.as_str() || host.ends_with(&format!(".{d}")))
            .cloned()
    }

    /// Fetch one URL through the cascade, honoring cache freshness.
    pub async fn fetch(&self, raw_dir: &Path, url: &str, force: bool) -> FetchOutcome {
        if let Some(domain) = self.blocked_domain(url) {
            return FetchOutcome::failed(
                url,
                BridgeError::Blocked(format!("{domain} blocks automated fetching")),
            );
        }
        if Url::parse(url).is_err() {
            return FetchOutcome::failed(url, BridgeError::Validation(format!("invalid URL: {url}")));
        }

        let doc_path = raw_dir.join(url_to_relpath(url));

        if !force {
            if let Some((content, meta)) = self.fresh_cache(&doc_path).await {
                debug!(url, "serving from raw cache");
                return FetchOutcome {
                    url: url.to_string(),
                    content: Some(content),
                    path: Some(doc_path),
                    meta: Some(meta),
                    from_cache: true,
                    error: None,
                };
            }
        }

        let (content, source, tokens) = match self.cascade(url).await {
            Ok(found) => found,
            Err(e) => return FetchOutcome::failed(url, e),
        };

        let meta = FetchMeta {
            url: url.to_string(),
            fetched_at: Utc::now(),
            content_hash: content_hash(&content),
            size_bytes: content.len(),
            markdown_source: source.to_string(),
            markdown_tokens: tokens,
        };
        if let Err(e) = self.store_raw(&doc_path, &content, &meta).await {
            return FetchOutcome::failed(url, e);
        }
        info!(url, source, bytes = content.len(), "fetched and cached");

        FetchOutcome {
            url: url.to_string(),
            content: Some(content),
            path: Some(doc_path),
            meta: Some(meta),
            from_cache: false,
            error: None,
        }
    }

    async fn fresh_cache(&self, doc_path: &Path) -> Option<(String, FetchMeta)> {
        let raw_meta = tokio::fs::read_to_string(meta_path(doc_path)).await.ok()?;
        let meta: FetchMeta = serde_json::from_str(&raw_meta).ok()?;
        let age = Utc::now().signed_duration_since(meta.fetched_at);
        if age.num_seconds() < 0 || age.num_seconds() as u64 > self.config.freshness_days * 86_400 {
            return None;
        }
        let content = tokio::fs::read_to_string(doc_path).await.ok()?;
        Some((content, meta))
    }

    /// Negotiated → proxy → local conversion. The first two tiers swallow
    /// their failures; only the final tier surfaces one.
    async fn cascade(&self, url: &str) -> BridgeResult<(String, &'static str, Option<u64>)> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);

        // Tier 1: content negotiation.
        if let Ok(response) = self
            .http
            .get(url)
            .timeout(timeout)
            .header(reqwest::header::ACCEPT, "text/markdown")
            .send()
            .await
        {
            if response.status().is_success() {
                let negotiated = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|ct| ct.contains("text/markdown"));
                let tokens = header_u64(&response, TOKENS_HEADER);
                if let Ok(body) = response.text().await {
                    if negotiated || looks_like_markdown(&body) {
                        return Ok((body, sources::NEGOTIATED, tokens));
                    }
                }
            }
        }

        // Tier 2: HTML-to-markdown proxy. Blocked URLs never reach here.
        let proxy_url = format!("{}/{}", self.config.proxy_base.trim_end_matches('/'), url);
        if let Ok(response) = self.http.get(&proxy_url).timeout(timeout).send().await {
            if response.status().is_success() {
                let tokens = header_u64(&response, TOKENS_HEADER);
                if let Ok(body) = response.text().await {
                    if looks_like_markdown(&body) {
                        return Ok((body, sources::PROXY, tokens));
                    }
                }
            }
        }

        // Tier 3: raw fetch + local conversion.
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(BridgeError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Transport(format!(
                "HTTP {} fetching {url}",
                status.as_u16()
            )));
        }
        let body = response.text().await.map_err(BridgeError::from)?;
        let content = if is_htmlish(&body) {
            html_to_markdown(&body)
        } else {
            body
        };
        if content.trim().is_empty() {
            return Err(BridgeError::NotFound(format!("no textual content at {url}")));
        }
        Ok((content, sources::CONVERTED, None))
    }

    async fn store_raw(&self, doc_path: &Path, content: &str, meta: &FetchMeta) -> BridgeResult<()> {
        if let Some(parent) = doc_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = doc_path.with_extension("md.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, doc_path).await?;
        tokio::fs::write(meta_path(doc_path), serde_json::to_vec_pretty(meta)?).await?;
        Ok(())
    }

    /// Load local files matching a glob pattern, mirroring them into the raw
    /// cache under the `local` library.
    pub async fn load_dir(
        &self,
        raw_dir: &Path,
        base: &Path,
        pattern: &str,
    ) -> BridgeResult<Vec<LoadedFile>> {
        let matcher = glob_to_regex(pattern)?;
        let mut loaded = Vec::new();

        for entry in walkdir::WalkDir::new(base)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let rel = match entry.path().strip_prefix(base) {
                Ok(r) => r.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            if !matcher.is_match(&rel) {
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };

            let mut cache_path = raw_dir.join("local").join(&rel);
            if cache_path.extension().is_none() {
                cache_path.set_extension("md");
            }
            let meta = FetchMeta {
                url: format!("file://{}", entry.path().display()),
                fetched_at: Utc::now(),
                content_hash: content_hash(&content),
                size_bytes: content.len(),
                markdown_source: sources::CONVERTED.to_string(),
                markdown_tokens: None,
            };
            self.store_raw(&cache_path, &content, &meta).await?;

            loaded.push(LoadedFile {
                title: rel,
                path: entry.path().to_path_buf(),
                content,
            });
        }
        loaded.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(loaded)
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Translate a glob (`*`, `?`, `**`) into an anchored regex over relative
/// paths.
fn glob_to_regex(pattern: &str) -> BridgeResult<Regex> {
    let pattern = pattern.trim_start_matches("./");
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            c if "\\.+()|[]{}^$".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');
    Regex::new(&regex)
        .map_err(|e| BridgeError::Validation(format!("bad glob pattern '{pattern}': {e}")))
}
