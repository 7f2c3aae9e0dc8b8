//! Fetch and research tools: fetch, load_dir, fetch_sitemap, research.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{BridgeError, BridgeResult};
use crate::fetch::{extract_library_name, FetchOutcome};
use crate::knowledge::{IngestRequest, KnowledgeStore};

use super::{ServiceContext, Tool, ToolDefinition, ToolOutput, ToolRegistry};

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServiceContext>) {
    registry.register(Box::new(FetchTool(Arc::clone(ctx))));
    registry.register(Box::new(LoadDirTool(Arc::clone(ctx))));
    registry.register(Box::new(FetchSitemapTool(Arc::clone(ctx))));
    registry.register(Box::new(ResearchTool(Arc::clone(ctx))));
}

/// Index a successful fetch outcome; returns chunks added (0 on dedup or
/// ingest failure, which must not fail the fetch).
async fn index_outcome(store: &KnowledgeStore, outcome: &FetchOutcome) -> usize {
    let Some(content) = &outcome.content else {
        return 0;
    };
    let metadata = outcome
        .meta
        .as_ref()
        .and_then(|m| serde_json::to_value(m).ok())
        .unwrap_or(Value::Null);
    let request = IngestRequest::new(
        &outcome.url,
        extract_library_name(&outcome.url),
        content.clone(),
    )
    .with_metadata(metadata);
    match store.ingest(request).await {
        Ok(report) => report.chunks,
        Err(e) => {
            warn!(url = %outcome.url, error = %e, "index after fetch failed");
            0
        }
    }
}

struct FetchTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fetch".into(),
            description: "Fetch a URL as markdown, cache it, and index it".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "force": {"type": "boolean"},
                    "project": {"type": "string"}
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let url = arguments["url"].as_str().unwrap_or_default();
        let force = arguments["force"].as_bool().unwrap_or(false);
        let project = self.0.project_id(arguments["project"].as_str());

        let outcome = self
            .0
            .fetcher
            .fetch(&self.0.raw_dir(&project), url, force)
            .await;

        if let Some(failure) = &outcome.error {
            return Ok(ToolOutput {
                content: serde_json::to_value(failure)?,
                is_error: true,
            });
        }

        let store = self.0.stores.get(&project).await?;
        let indexed_chunks = index_outcome(&store, &outcome).await;
        let meta = outcome.meta.as_ref();
        Ok(ToolOutput::success(json!({
            "url": outcome.url,
            "from_cache": outcome.from_cache,
            "path": outcome.path.as_ref().map(|p| p.display().to_string()),
            "markdown_source": meta.map(|m| m.markdown_source.clone()),
            "size_bytes": meta.map(|m| m.size_bytes),
            "markdown_tokens": meta.and_then(|m| m.markdown_tokens),
            "indexed_chunks": indexed_chunks,
        })))
    }
}

struct LoadDirTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for LoadDirTool {
    fn name(&self) -> &str {
        "load_dir"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "load_dir".into(),
            description: "Ingest local files matching a glob into the knowledge index".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "glob": {"type": "string"},
                    "project": {"type": "string"}
                },
                "required": ["glob"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let pattern = arguments["glob"].as_str().unwrap_or_default();
        let project = self.0.project_id(arguments["project"].as_str());
        let base = std::env::current_dir()?;

        let files = self
            .0
            .fetcher
            .load_dir(&self.0.raw_dir(&project), &base, pattern)
            .await?;
        if files.is_empty() {
            return Err(BridgeError::NotFound(format!(
                "no files matched pattern '{pattern}'"
            )));
        }

        let store = self.0.stores.get(&project).await?;
        let requests: Vec<IngestRequest> = files
            .iter()
            .map(|f| {
                IngestRequest::new(&f.title, "local", &f.content)
                    .with_metadata(json!({"path": f.path.display().to_string()}))
            })
            .collect();
        let reports = store.ingest_many(requests).await?;

        let total_bytes: usize = files.iter().map(|f| f.content.len()).sum();
        Ok(ToolOutput::success(json!({
            "loaded": files.len(),
            "total_bytes": total_bytes,
            "indexed_chunks": reports.iter().map(|r| r.chunks).sum::<usize>(),
            "deduplicated": reports.iter().filter(|r| r.deduplicated).count(),
        })))
    }
}

struct FetchSitemapTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for FetchSitemapTool {
    fn name(&self) -> &str {
        "fetch_sitemap"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fetch_sitemap".into(),
            description: "Fetch every page of a sitemap and index the results".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "force": {"type": "boolean"},
                    "project": {"type": "string"}
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let url = arguments["url"].as_str().unwrap_or_default();
        let force = arguments["force"].as_bool().unwrap_or(false);
        let project = self.0.project_id(arguments["project"].as_str());

        let (report, outcomes) = self
            .0
            .fetcher
            .fetch_sitemap(&self.0.raw_dir(&project), url, force)
            .await?;

        let store = self.0.stores.get(&project).await?;
        let mut indexed_chunks = 0;
        for outcome in &outcomes {
            if outcome.ok() {
                indexed_chunks += index_outcome(&store, outcome).await;
            }
        }

        Ok(ToolOutput::success(json!({
            "sitemap_url": report.sitemap_url,
            "fetched": report.fetched,
            "failed": report.failed,
            "total_bytes": report.total_bytes,
            "indexed_chunks": indexed_chunks,
            "errors": report.errors.iter().take(10).collect::<Vec<_>>(),
        })))
    }
}

struct ResearchTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for ResearchTool {
    fn name(&self) -> &str {
        "research"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "research".into(),
            description: "Discover, fetch, and index documentation for a topic".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string"},
                    "project": {"type": "string"},
                    "seeds": {"type": "array"}
                },
                "required": ["topic"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let topic = arguments["topic"].as_str().unwrap_or_default();
        let project = self.0.project_id(arguments["project"].as_str());
        let seeds: Vec<String> = arguments["seeds"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let store = self.0.stores.get(&project).await?;
        let report = self
            .0
            .research
            .research(&store, &self.0.raw_dir(&project), topic, &seeds)
            .await?;
        Ok(ToolOutput::success(serde_json::to_value(report)?))
    }
}
