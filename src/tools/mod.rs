//! The fixed tool surface exposed to the client.
//!
//! Each tool declares a JSON-schema-like argument contract; arguments are
//! validated before dispatch and every failure comes back as a structured
//! `{error_kind, message}` object. No condition crosses the client boundary
//! as an unhandled error: anything uncaught is wrapped as `internal` with a
//! generic message.

pub mod fetch_tools;
pub mod kernel_tools;
pub mod knowledge_tools;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::error;

use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};
use crate::fetch::Fetcher;
use crate::kernel::KernelManager;
use crate::knowledge::{KnowledgeStore, ProjectStores};
use crate::lm::LanguageModel;
use crate::research::ResearchOrchestrator;
use crate::subagent::SubAgentRunner;

/// Services shared by every tool handler.
pub struct ServiceContext {
    pub config: Config,
    pub kernel: Arc<KernelManager>,
    pub stores: Arc<ProjectStores>,
    pub fetcher: Arc<Fetcher>,
    pub research: Arc<ResearchOrchestrator>,
    pub runner: Arc<SubAgentRunner>,
    pub ledger: Arc<crate::callback::UsageLedger>,
    pub sub_model: Arc<dyn LanguageModel>,
    /// Serializes kernel executes against snapshot saves.
    pub exec_gate: Arc<Mutex<()>>,
    /// Project id derived from the working directory.
    pub default_project: String,
}

impl ServiceContext {
    pub fn project_id(&self, explicit: Option<&str>) -> String {
        match explicit {
            Some(p) if !p.trim().is_empty() => p.trim().to_string(),
            _ => self.default_project.clone(),
        }
    }

    pub fn raw_dir(&self, project_id: &str) -> PathBuf {
        self.config.storage.raw_docs_dir(project_id)
    }

    pub async fn store_for(&self, explicit: Option<&str>) -> BridgeResult<Arc<KnowledgeStore>> {
        self.stores.get(&self.project_id(explicit)).await
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Structured result of a tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn failure(err: &BridgeError) -> Self {
        Self {
            content: json!({"error_kind": err.kind(), "message": err.to_string()}),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register the full fixed surface against a service context.
    pub fn standard(ctx: Arc<ServiceContext>) -> Self {
        let mut registry = Self::new();
        kernel_tools::register(&mut registry, &ctx);
        knowledge_tools::register(&mut registry, &ctx);
        fetch_tools::register(&mut registry, &ctx);
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate and run one tool call. The returned value is always a
    /// structured envelope: `{ok: true, result}` or `{ok: false, error}`.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Value {
        let Some(tool) = self.get(name) else {
            return envelope(ToolOutput::failure(&BridgeError::NotFound(format!(
                "unknown tool '{name}'"
            ))));
        };

        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        if let Err(e) = validate_arguments(&tool.definition().input_schema, &arguments) {
            return envelope(ToolOutput::failure(&e));
        }

        match tool.execute(arguments).await {
            Ok(output) => envelope(output),
            Err(e) => {
                let internal = matches!(
                    &e,
                    BridgeError::Serialization(_)
                        | BridgeError::Io(_)
                        | BridgeError::Internal(_)
                        | BridgeError::Other(_)
                );
                let sanitized = if internal {
                    error!(tool = name, error = %e, "tool failed internally");
                    BridgeError::Internal("the tool failed internally".into())
                } else {
                    e
                };
                envelope(ToolOutput::failure(&sanitized))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn envelope(output: ToolOutput) -> Value {
    if output.is_error {
        json!({"ok": false, "error": output.content})
    } else {
        json!({"ok": true, "result": output.content})
    }
}

/// Check required fields and primitive types against the declared schema.
fn validate_arguments(schema: &Value, arguments: &Value) -> BridgeResult<()> {
    let Some(object) = arguments.as_object() else {
        return Err(BridgeError::Validation("arguments must be an object".into()));
    };

    if let Some(required) = schema["required"].as_array() {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !object.contains_key(field) || object[field].is_null() {
                return Err(BridgeError::Validation(format!(
                    "missing required argument '{field}'"
                )));
            }
        }
    }

    if let Some(properties) = schema["properties"].as_object() {
        for (key, value) in object {
            let Some(spec) = properties.get(key) else {
                return Err(BridgeError::Validation(format!("unknown argument '{key}'")));
            };
            if value.is_null() {
                continue;
            }
            let expected = spec["type"].as_str().unwrap_or("object");
            let matches = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(BridgeError::Validation(format!(
                    "argument '{key}' must be a {expected}"
                )));
            }
        }
    }
    Ok(())
}
