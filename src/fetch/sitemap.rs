//! Sitemap expansion: `<loc>` extraction and bounded-concurrency page fetch.

use std::path::Path;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};

use super::{FetchOutcome, Fetcher};

/// Concurrent page fetches per sitemap.
const SITEMAP_CONCURRENCY: usize = 4;

/// Safety cap on pages pulled from one sitemap tree.
const MAX_SITEMAP_URLS: usize = 500;

/// Extract every `<loc>` URL from sitemap XML. Namespace prefixes are
/// irrelevant to this shape, so a tag-local match suffices.
pub fn parse_sitemap(xml: &str) -> Vec<String> {
    let re = Regex::new(r"<(?:[A-Za-z0-9_-]+:)?loc>\s*([^<\s][^<]*?)\s*</(?:[A-Za-z0-9_-]+:)?loc>")
        .expect("static regex");
    re.captures_iter(xml)
        .map(|c| c[1].to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SitemapReport {
    pub sitemap_url: String,
    pub fetched: usize,
    pub failed: usize,
    pub total_bytes: usize,
    pub errors: Vec<String>,
}

impl Fetcher {
    /// Resolve a sitemap (recursing one level into nested sitemap indexes)
    /// into the list of page URLs it covers.
    pub async fn expand_sitemap(&self, sitemap_url: &str) -> BridgeResult<Vec<String>> {
        if let Some(domain) = self.blocked_domain(sitemap_url) {
            return Err(BridgeError::Blocked(format!(
                "{domain} blocks automated fetching"
            )));
        }

        let entries = parse_sitemap(&self.get_xml(sitemap_url).await?);
        let mut pages = Vec::new();
        for entry in entries {
            if pages.len() >= MAX_SITEMAP_URLS {
                warn!(sitemap_url, cap = MAX_SITEMAP_URLS, "sitemap truncated at cap");
                break;
            }
            if entry.ends_with(".xml") && entry != sitemap_url {
                match self.get_xml(&entry).await {
                    Ok(xml) => {
                        for page in parse_sitemap(&xml) {
                            if pages.len() >= MAX_SITEMAP_URLS {
                                break;
                            }
                            if !page.ends_with(".xml") {
                                pages.push(page);
                            }
                        }
                    }
                    Err(e) => warn!(nested = %entry, error = %e, "nested sitemap fetch failed"),
                }
            } else {
                pages.push(entry);
            }
        }
        Ok(pages)
    }

    /// Fetch every page of a sitemap through the cascade, at most
    /// [`SITEMAP_CONCURRENCY`] in flight, pacing each fetch.
    pub async fn fetch_sitemap(
        &self,
        raw_dir: &Path,
        sitemap_url: &str,
        force: bool,
    ) -> BridgeResult<(SitemapReport, Vec<FetchOutcome>)> {
        let urls = self.expand_sitemap(sitemap_url).await?;
        if urls.is_empty() {
            return Ok((
                SitemapReport {
                    sitemap_url: sitemap_url.to_string(),
                    fetched: 0,
                    failed: 0,
                    total_bytes: 0,
                    errors: vec!["no URLs found in sitemap".into()],
                },
                Vec::new(),
            ));
        }

        let delay = Duration::from_millis(self.config().sitemap_delay_ms);
        let outcomes: Vec<FetchOutcome> = stream::iter(urls)
            .map(|url| async move {
                let outcome = self.fetch(raw_dir, &url, force).await;
                if !outcome.from_cache {
                    tokio::time::sleep(delay).await;
                }
                outcome
            })
            .buffer_unordered(SITEMAP_CONCURRENCY)
            .collect()
            .await;

        let mut report = SitemapReport {
            sitemap_url: sitemap_url.to_string(),
            fetched: 0,
            failed: 0,
            total_bytes: 0,
            errors: Vec::new(),
        };
        for outcome in &outcomes {
            match &outcome.error {
                None => {
                    report.fetched += 1;
                    report.total_bytes += outcome.meta.as_ref().map_or(0, |m| m.size_bytes);
                }
                Some(failure) => {
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", outcome.url, failure.message));
                }
            }
        }
        info!(
            sitemap_url,
            fetched = report.fetched,
            failed = report.failed,
            "sitemap expansion complete"
        );
        Ok((report, outcomes))
    }

    async fn get_xml(&self, url: &str) -> BridgeResult<String> {
        let response = self
            .http_client()
            .get(url)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Transport(format!(
                "HTTP {} fetching sitemap {url}",
                status.as_u16()
            )));
        }
        Ok(response.text().await?)
    }
}
