//! Knowledge-store tools: search, ask, timeline, ingest, knowledge_status,
//! knowledge_clear.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::BridgeResult;
use crate::knowledge::{IngestRequest, SearchMode};

use super::{ServiceContext, Tool, ToolDefinition, ToolOutput, ToolRegistry};

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServiceContext>) {
    registry.register(Box::new(SearchTool(Arc::clone(ctx))));
    registry.register(Box::new(AskTool(Arc::clone(ctx))));
    registry.register(Box::new(TimelineTool(Arc::clone(ctx))));
    registry.register(Box::new(IngestTool(Arc::clone(ctx))));
    registry.register(Box::new(KnowledgeStatusTool(Arc::clone(ctx))));
    registry.register(Box::new(KnowledgeClearTool(Arc::clone(ctx))));
}

struct SearchTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search".into(),
            description: "Ranked retrieval over the project knowledge index".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "top_k": {"type": "integer"},
                    "mode": {"type": "string"},
                    "project": {"type": "string"},
                    "thread": {"type": "string"},
                    "label": {"type": "string"}
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let query = arguments["query"].as_str().unwrap_or_default();
        let top_k = arguments["top_k"].as_u64().unwrap_or(10) as usize;
        let mode: SearchMode = arguments["mode"]
            .as_str()
            .unwrap_or("hybrid")
            .parse()?;

        let store = self.0.store_for(arguments["project"].as_str()).await?;
        let hits = store
            .search(
                query,
                top_k,
                mode,
                arguments["thread"].as_str(),
                arguments["label"].as_str(),
            )
            .await;
        Ok(ToolOutput::success(json!({
            "hits": serde_json::to_value(&hits)?,
            "count": hits.len(),
        })))
    }
}

struct AskTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for AskTool {
    fn name(&self) -> &str {
        "ask"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "ask".into(),
            description: "Retrieve context for a question; optionally compose an answer".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "context_only": {"type": "boolean"},
                    "project": {"type": "string"},
                    "thread": {"type": "string"}
                },
                "required": ["question"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let question = arguments["question"].as_str().unwrap_or_default();
        let context_only = arguments["context_only"]
            .as_bool()
            .unwrap_or(self.0.config.ask_context_only);

        let store = self.0.store_for(arguments["project"].as_str()).await?;
        let model = (!context_only).then(|| self.0.sub_model.as_ref());
        let outcome = store
            .ask(question, context_only, arguments["thread"].as_str(), model)
            .await?;
        Ok(ToolOutput::success(serde_json::to_value(outcome)?))
    }
}

struct TimelineTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for TimelineTool {
    fn name(&self) -> &str {
        "timeline"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "timeline".into(),
            description: "Documents in ingestion order, bounded by unix timestamps".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "since": {"type": "integer"},
                    "until": {"type": "integer"},
                    "limit": {"type": "integer"},
                    "project": {"type": "string"}
                }
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let store = self.0.store_for(arguments["project"].as_str()).await?;
        let entries = store
            .timeline(
                arguments["since"].as_i64(),
                arguments["until"].as_i64(),
                arguments["limit"].as_u64().unwrap_or(20) as usize,
            )
            .await;
        Ok(ToolOutput::success(json!({
            "entries": serde_json::to_value(&entries)?,
            "count": entries.len(),
        })))
    }
}

struct IngestTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for IngestTool {
    fn name(&self) -> &str {
        "ingest"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "ingest".into(),
            description: "Add a document to the project knowledge index".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "label": {"type": "string"},
                    "text": {"type": "string"},
                    "thread": {"type": "string"},
                    "project": {"type": "string"}
                },
                "required": ["title", "text"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let store = self.0.store_for(arguments["project"].as_str()).await?;
        let request = IngestRequest::new(
            arguments["title"].as_str().unwrap_or_default(),
            arguments["label"].as_str().unwrap_or("kb"),
            arguments["text"].as_str().unwrap_or_default(),
        )
        .with_thread(arguments["thread"].as_str().map(String::from));

        let report = store.ingest(request).await?;
        Ok(ToolOutput::success(serde_json::to_value(report)?))
    }
}

struct KnowledgeStatusTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for KnowledgeStatusTool {
    fn name(&self) -> &str {
        "knowledge_status"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "knowledge_status".into(),
            description: "Index size and label/thread breakdown for a project".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"project": {"type": "string"}}
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let project = self.0.project_id(arguments["project"].as_str());
        let store = self.0.stores.get(&project).await?;
        let status = store.status().await;
        Ok(ToolOutput::success(json!({
            "project": project,
            "status": serde_json::to_value(status)?,
        })))
    }
}

struct KnowledgeClearTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for KnowledgeClearTool {
    fn name(&self) -> &str {
        "knowledge_clear"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "knowledge_clear".into(),
            description: "Delete a project's knowledge index".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"project": {"type": "string"}}
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let project = self.0.project_id(arguments["project"].as_str());
        self.0.stores.clear(&project).await?;
        Ok(ToolOutput::success(json!({
            "project": project,
            "cleared": true,
        })))
    }
}
