//! Kernel-facing tools: exec, load, get, vars, reset, sub_agent, usage.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{BridgeError, BridgeResult};
use crate::kernel::inject;
use crate::subagent::{signature, SubAgentLimits};

use super::{ServiceContext, Tool, ToolDefinition, ToolOutput, ToolRegistry};

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServiceContext>) {
    registry.register(Box::new(ExecTool(Arc::clone(ctx))));
    registry.register(Box::new(LoadTool(Arc::clone(ctx))));
    registry.register(Box::new(GetTool(Arc::clone(ctx))));
    registry.register(Box::new(VarsTool(Arc::clone(ctx))));
    registry.register(Box::new(ResetTool(Arc::clone(ctx))));
    registry.register(Box::new(SubAgentTool(Arc::clone(ctx))));
    registry.register(Box::new(UsageTool(Arc::clone(ctx))));
}

/// Directories never readable through `load`, even inside the home dir.
pub fn denied_roots() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    vec![
        home.join(".ssh"),
        home.join(".aws"),
        home.join(".config").join("gcloud"),
        home.join(".gnupg"),
    ]
}

struct ExecTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "exec".into(),
            description: "Execute code in the persistent kernel and return its output".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string"},
                    "timeout": {"type": "integer"}
                },
                "required": ["code"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let code = arguments["code"].as_str().unwrap_or_default();
        let timeout = arguments["timeout"]
            .as_u64()
            .unwrap_or(self.0.kernel.exec_timeout_secs());

        self.0.kernel.ensure_running().await?;
        let _gate = self.0.exec_gate.lock().await;
        let outcome = self.0.kernel.execute(code, timeout).await?;
        Ok(ToolOutput::success(json!({
            "output": outcome.output,
            "stderr": outcome.stderr,
            "vars": outcome.vars,
        })))
    }
}

struct LoadTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for LoadTool {
    fn name(&self) -> &str {
        "load"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "load".into(),
            description: "Read a host file and bind its content to a kernel variable".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "var_name": {"type": "string"}
                },
                "required": ["path", "var_name"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let path = arguments["path"].as_str().unwrap_or_default();
        let var_name = arguments["var_name"].as_str().unwrap_or_default();
        if !is_identifier(var_name) {
            return Err(BridgeError::Validation(format!(
                "'{var_name}' is not a valid variable name"
            )));
        }

        let content = read_host_file(path).await?;
        self.0.kernel.ensure_running().await?;
        let _gate = self.0.exec_gate.lock().await;
        let outcome = self
            .0
            .kernel
            .execute(&inject::assign_text_source(var_name, &content), 30)
            .await?;
        if !outcome.stderr.is_empty() {
            return Err(BridgeError::KernelRuntime(outcome.stderr));
        }
        Ok(ToolOutput::success(json!({
            "var_name": var_name,
            "chars": content.len(),
        })))
    }
}

/// Shared by `load` and the sandbox-callable `load_file`: resolve, apply the
/// denylist, read.
pub async fn read_host_file(path: &str) -> BridgeResult<String> {
    let expanded = if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest)
    } else {
        PathBuf::from(path)
    };
    let resolved = tokio::fs::canonicalize(&expanded)
        .await
        .map_err(|_| BridgeError::NotFound(format!("file not found: {path}")))?;

    if denied_roots().iter().any(|root| resolved.starts_with(root)) {
        return Err(BridgeError::Blocked(format!(
            "{} is in a restricted directory",
            resolved.display()
        )));
    }
    Ok(tokio::fs::read_to_string(&resolved).await?)
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

struct GetTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for GetTool {
    fn name(&self) -> &str {
        "get"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get".into(),
            description: "Read a kernel variable, or evaluate a query expression".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "query": {"type": "string"}
                },
                "required": ["name"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let name = arguments["name"].as_str().unwrap_or_default();
        self.0.kernel.ensure_running().await?;

        if let Some(query) = arguments["query"].as_str() {
            let _gate = self.0.exec_gate.lock().await;
            let outcome = self.0.kernel.execute(query, 30).await?;
            return Ok(ToolOutput::success(json!({
                "output": outcome.output,
                "stderr": outcome.stderr,
            })));
        }

        let value = self.0.kernel.client().get_variable(name).await?;
        Ok(ToolOutput::success(json!({"name": name, "value": value})))
    }
}

struct VarsTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for VarsTool {
    fn name(&self) -> &str {
        "vars"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "vars".into(),
            description: "List kernel variables with type and summary".into(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(&self, _arguments: Value) -> BridgeResult<ToolOutput> {
        self.0.kernel.ensure_running().await?;
        let vars = self.0.kernel.client().list_variables().await?;
        Ok(ToolOutput::success(serde_json::to_value(vars)?))
    }
}

struct ResetTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for ResetTool {
    fn name(&self) -> &str {
        "reset"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "reset".into(),
            description: "Clear all kernel state".into(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(&self, _arguments: Value) -> BridgeResult<ToolOutput> {
        self.0.kernel.ensure_running().await?;
        let _gate = self.0.exec_gate.lock().await;
        let outcome = self.0.kernel.client().reset().await?;
        Ok(ToolOutput::success(json!({
            "reset": true,
            "warnings": outcome.stderr,
        })))
    }
}

struct SubAgentTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        "sub_agent"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "sub_agent".into(),
            description: "Run a bounded reasoning loop over the kernel with a signature".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "signature": {"type": "string"},
                    "inputs": {"type": "object"},
                    "limits": {"type": "object"}
                },
                "required": ["signature", "inputs"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let spec = arguments["signature"].as_str().unwrap_or_default();
        let signature = signature::resolve(spec)?;
        let inputs = arguments["inputs"]
            .as_object()
            .cloned()
            .unwrap_or_default();

        let mut limits = SubAgentLimits::default();
        if let Some(overrides) = arguments["limits"].as_object() {
            if let Some(v) = overrides.get("max_iterations").and_then(Value::as_u64) {
                limits.max_iterations = v as usize;
            }
            if let Some(v) = overrides.get("max_llm_calls").and_then(Value::as_u64) {
                limits.max_llm_calls = v as usize;
            }
            if let Some(v) = overrides.get("max_output_chars").and_then(Value::as_u64) {
                limits.max_output_chars = v as usize;
            }
        }

        let run = self.0.runner.run(&signature, &inputs, limits).await?;
        Ok(ToolOutput::success(serde_json::to_value(run)?))
    }
}

struct UsageTool(Arc<ServiceContext>);

#[async_trait]
impl Tool for UsageTool {
    fn name(&self) -> &str {
        "usage"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "usage".into(),
            description: "Report cumulative sub-model usage, optionally resetting it".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"reset": {"type": "boolean"}}
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> BridgeResult<ToolOutput> {
        let snapshot = self.0.ledger.snapshot();
        if arguments["reset"].as_bool().unwrap_or(false) {
            self.0.ledger.reset();
        }
        Ok(ToolOutput::success(serde_json::to_value(snapshot)?))
    }
}
