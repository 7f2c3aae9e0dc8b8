//! Compound research operation: resolve a topic to candidate documentation
//! URLs, fetch each through the cascade, ingest what sticks, report counts.
//!
//! Fetched content never flows back to the client; only the tallies do.

use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::BridgeResult;
use crate::fetch::{extract_library_name, FetchOutcome, Fetcher};
use crate::knowledge::{IngestRequest, KnowledgeStore};

/// Concurrent page fetches during research.
const RESEARCH_CONCURRENCY: usize = 4;

/// Maps a topic to candidate documentation URLs.
///
/// The default derives sitemap locations from the topic slug; deployments
/// with a real catalog plug their own resolver in here.
pub trait DocResolver: Send + Sync {
    fn resolve(&self, topic: &str) -> Vec<String>;
}

/// Pattern-based resolver over common documentation hosts.
pub struct PatternResolver;

impl DocResolver for PatternResolver {
    fn resolve(&self, topic: &str) -> Vec<String> {
        let slug: String = topic
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .trim_matches('-')
            .to_string();
        if slug.is_empty() {
            return Vec::new();
        }
        vec![
            format!("https://docs.{slug}.com/sitemap.xml"),
            format!("https://{slug}.dev/sitemap.xml"),
            format!("https://{slug}.readthedocs.io/sitemap.xml"),
            format!("https://docs.{slug}.io/sitemap.xml"),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResearchReport {
    pub topic: String,
    pub sources: usize,
    pub failed: usize,
    pub indexed_chunks: usize,
}

pub struct ResearchOrchestrator {
    fetcher: Arc<Fetcher>,
    resolver: Arc<dyn DocResolver>,
}

impl ResearchOrchestrator {
    pub fn new(fetcher: Arc<Fetcher>, resolver: Arc<dyn DocResolver>) -> Self {
        Self { fetcher, resolver }
    }

    /// Discover, fetch, and ingest documentation for a topic. Seed URLs from
    /// the caller run ahead of resolver candidates; duplicates collapse.
    pub async fn research(
        &self,
        store: &KnowledgeStore,
        raw_dir: &Path,
        topic: &str,
        seeds: &[String],
    ) -> BridgeResult<ResearchReport> {
        let mut candidates: Vec<String> = Vec::new();
        for url in seeds.iter().cloned().chain(self.resolver.resolve(topic)) {
            if !candidates.contains(&url) {
                candidates.push(url);
            }
        }

        let mut report = ResearchReport {
            topic: topic.to_string(),
            sources: 0,
            failed: 0,
            indexed_chunks: 0,
        };

        for candidate in candidates {
            let outcomes = if candidate.ends_with("sitemap.xml") {
                match self.fetcher.fetch_sitemap(raw_dir, &candidate, false).await {
                    Ok((_, outcomes)) => outcomes,
                    Err(e) => {
                        warn!(url = %candidate, error = %e, "sitemap candidate failed");
                        report.failed += 1;
                        continue;
                    }
                }
            } else {
                self.fetch_pages(raw_dir, vec![candidate]).await
            };

            let had_success = outcomes.iter().any(FetchOutcome::ok);
            for outcome in outcomes {
                let usable = outcome.error.is_none();
                match (usable, outcome.content) {
                    (true, Some(content)) => {
                        report.sources += 1;
                        report.indexed_chunks += self
                            .ingest_outcome(store, &outcome.url, content, outcome.meta)
                            .await;
                    }
                    _ => report.failed += 1,
                }
            }
            // A productive sitemap covers the topic; stop probing patterns.
            if had_success && report.sources > 1 {
                break;
            }
        }

        info!(
            topic,
            sources = report.sources,
            failed = report.failed,
            chunks = report.indexed_chunks,
            "research complete"
        );
        Ok(report)
    }

    async fn fetch_pages(&self, raw_dir: &Path, urls: Vec<String>) -> Vec<FetchOutcome> {
        stream::iter(urls)
            .map(|url| {
                let fetcher = Arc::clone(&self.fetcher);
                async move { fetcher.fetch(raw_dir, &url, false).await }
            })
            .buffer_unordered(RESEARCH_CONCURRENCY)
            .collect()
            .await
    }

    async fn ingest_outcome(
        &self,
        store: &KnowledgeStore,
        url: &str,
        content: String,
        meta: Option<crate::fetch::FetchMeta>,
    ) -> usize {
        let metadata = meta
            .and_then(|m| serde_json::to_value(m).ok())
            .unwrap_or(serde_json::Value::Null);
        let request = IngestRequest::new(url, extract_library_name(url), content)
            .with_metadata(metadata);
        match store.ingest(request).await {
            Ok(r) => r.chunks,
            Err(e) => {
                warn!(url, error = %e, "ingest failed during research");
                0
            }
        }
    }
}
