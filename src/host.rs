//! Lifecycle host: composes the kernel, knowledge, fetch, research,
//! sub-agent, and callback components, exposes the tool surface over a
//! line-delimited JSON-RPC stdio transport, and tears everything down in
//! order on stop.
//!
//! No kernel starts at init; the first kernel-using tool call triggers the
//! lazy start, which injects the sandbox helpers and restores the session
//! snapshot before any dispatch reaches the kernel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::callback::{CallbackServer, SandboxToolHandler};
use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};
use crate::fetch::Fetcher;
use crate::kernel::{inject, session_id_for, KernelManager, SessionSnapshotter};
use crate::knowledge::{project_id_for, HashedEmbedder, ProjectStores, SearchMode};
use crate::lm::{AnthropicModel, LanguageModel};
use crate::protocol::{error_codes, methods, RequestId, RpcRequest, RpcResponse, ToolCallParams};
use crate::research::{PatternResolver, ResearchOrchestrator};
use crate::subagent::SubAgentRunner;
use crate::tools::{kernel_tools, ServiceContext, ToolRegistry};

pub struct LifecycleHost {
    registry: ToolRegistry,
    ctx: Arc<ServiceContext>,
    callback: CallbackServer,
    snapshotter: Arc<SessionSnapshotter>,
    snapshot_task: Option<tokio::task::JoinHandle<()>>,
}

impl LifecycleHost {
    /// Bring up everything except the kernel.
    pub async fn start(config: Config) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| BridgeError::Internal(format!("cannot build HTTP client: {e}")))?;

        let working_dir = std::env::current_dir()?;
        let default_project = project_id_for(&working_dir);
        let session_id = session_id_for(&working_dir);

        let sub_model: Arc<dyn LanguageModel> = Arc::new(AnthropicModel::new(
            http.clone(),
            config.models.api_base.clone(),
            config.models.sub_model.clone(),
        ));
        let main_model: Arc<dyn LanguageModel> = Arc::new(AnthropicModel::new(
            http.clone(),
            config.models.api_base.clone(),
            config.models.main_model.clone(),
        ));

        let kernel = Arc::new(KernelManager::new(config.kernel.clone(), http.clone()));
        let stores = Arc::new(ProjectStores::new(
            config.storage.knowledge_dir(),
            Arc::new(HashedEmbedder::default()),
        ));
        let fetcher = Arc::new(Fetcher::new(http.clone(), config.fetch.clone()));
        let research = Arc::new(ResearchOrchestrator::new(
            Arc::clone(&fetcher),
            Arc::new(PatternResolver),
        ));

        let mut callback = CallbackServer::new(
            config.callback.port,
            config.callback.body_limit_bytes,
            Arc::clone(&sub_model),
        );
        register_sandbox_tools(
            &mut callback,
            &config,
            &stores,
            &fetcher,
            &sub_model,
            &default_project,
        );
        callback.start().await?;

        let ledger = callback.ledger();
        let runner = Arc::new(SubAgentRunner::new(
            main_model,
            Arc::clone(&kernel),
            Arc::clone(&ledger),
        ));
        let exec_gate = Arc::new(Mutex::new(()));

        let snapshotter = Arc::new(SessionSnapshotter::new(
            config.storage.sessions_dir(),
            session_id,
            config.snapshot.expiry_days,
        ));

        // Injection + one-time restore, re-run after every kernel (re)start.
        let bound_port = callback.port();
        let local_base = format!("http://127.0.0.1:{bound_port}");
        let container_base = format!("http://{}:{bound_port}", config.callback.container_host);
        let restored = Arc::new(AtomicBool::new(false));
        let kernel_weak: Weak<KernelManager> = Arc::downgrade(&kernel);
        let hook_snapshotter = Arc::clone(&snapshotter);
        kernel
            .on_restart(Arc::new(move || {
                let kernel_weak = kernel_weak.clone();
                let local_base = local_base.clone();
                let container_base = container_base.clone();
                let restored = Arc::clone(&restored);
                let snapshotter = Arc::clone(&hook_snapshotter);
                Box::pin(async move {
                    let Some(kernel) = kernel_weak.upgrade() else {
                        return Ok(());
                    };
                    let base = match kernel.tier_hint() {
                        Some(crate::kernel::IsolationTier::Container) => &container_base,
                        _ => &local_base,
                    };
                    let client = kernel.client();
                    client.execute(&inject::llm_stub_source(base), 30).await?;
                    client
                        .execute(&inject::tool_stub_source(base, inject::SANDBOX_TOOLS), 30)
                        .await?;
                    if !restored.swap(true, Ordering::SeqCst) {
                        snapshotter.restore(client).await?;
                    }
                    Ok(())
                })
            }))
            .await;

        let swept = snapshotter.cleanup_expired().await;
        if swept > 0 {
            info!(swept, "expired session snapshots removed");
        }

        let snapshot_task = Arc::clone(&snapshotter).spawn_periodic(
            Arc::clone(&kernel),
            Arc::clone(&exec_gate),
            std::time::Duration::from_secs(config.snapshot.interval_secs),
        );

        let ctx = Arc::new(ServiceContext {
            config,
            kernel,
            stores,
            fetcher,
            research,
            runner,
            ledger,
            sub_model,
            exec_gate,
            default_project,
        });
        let registry = ToolRegistry::standard(Arc::clone(&ctx));

        info!(tools = registry.len(), "lifecycle host started");
        Ok(Self {
            registry,
            ctx,
            callback,
            snapshotter,
            snapshot_task: Some(snapshot_task),
        })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, name: &str, arguments: serde_json::Value) -> serde_json::Value {
        self.registry.dispatch(name, arguments).await
    }

    /// Serve line-delimited JSON-RPC over stdio until EOF or `shutdown`.
    pub async fn serve_stdio(&self) -> BridgeResult<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let (response, shutdown) = self.handle_line(&line).await;
            let mut wire = serde_json::to_string(&response)?;
            wire.push('\n');
            stdout.write_all(wire.as_bytes()).await?;
            stdout.flush().await?;
            if shutdown {
                break;
            }
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> (RpcResponse, bool) {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                return (
                    RpcResponse::failure(
                        RequestId::Number(0),
                        error_codes::PARSE_ERROR,
                        format!("malformed request: {e}"),
                    ),
                    false,
                );
            }
        };

        let id = request.id.clone();
        match request.method.as_str() {
            methods::INITIALIZE => (
                RpcResponse::success(
                    id,
                    json!({
                        "server": {"name": "toolbridge", "version": env!("CARGO_PKG_VERSION")},
                        "tool_count": self.registry.len(),
                    }),
                ),
                false,
            ),
            methods::TOOLS_LIST => {
                let tools: Vec<serde_json::Value> = self
                    .registry
                    .definitions()
                    .into_iter()
                    .map(|d| {
                        json!({
                            "name": d.name,
                            "description": d.description,
                            "input_schema": d.input_schema,
                        })
                    })
                    .collect();
                (RpcResponse::success(id, json!({"tools": tools})), false)
            }
            methods::TOOLS_CALL => match request
                .params
                .and_then(|p| serde_json::from_value::<ToolCallParams>(p).ok())
            {
                Some(params) => {
                    let result = self.dispatch(&params.name, params.arguments).await;
                    (RpcResponse::success(id, result), false)
                }
                None => (
                    RpcResponse::failure(
                        id,
                        error_codes::INVALID_PARAMS,
                        "tools/call requires {name, arguments}",
                    ),
                    false,
                ),
            },
            methods::SHUTDOWN => (RpcResponse::success(id, json!({"ok": true})), true),
            other => (
                RpcResponse::failure(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("unknown method '{other}'"),
                ),
                false,
            ),
        }
    }

    /// Drain the callback server, snapshot the session, stop the kernel,
    /// close every store. Runs each step even if an earlier one fails.
    pub async fn stop(&mut self) {
        self.callback.stop().await;

        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }

        if self.ctx.kernel.current_tier().await.is_some() {
            let _gate = self.ctx.exec_gate.lock().await;
            if let Err(e) = self.snapshotter.save(self.ctx.kernel.client()).await {
                warn!(error = %e, "final snapshot failed");
            }
        }

        self.ctx.kernel.stop().await;
        self.ctx.stores.close_all().await;
        info!("lifecycle host stopped");
    }
}

/// Wire the sandbox-callable whitelist onto the callback server. Handlers
/// are read-only; mutation stays on the client-facing surface.
fn register_sandbox_tools(
    callback: &mut CallbackServer,
    config: &Config,
    stores: &Arc<ProjectStores>,
    fetcher: &Arc<Fetcher>,
    sub_model: &Arc<dyn LanguageModel>,
    default_project: &str,
) {
    let raw_dir: PathBuf = config.storage.raw_docs_dir(default_project);
    let project = default_project.to_string();
    let ask_context_only = config.ask_context_only;

    let h_stores = Arc::clone(stores);
    let h_project = project.clone();
    let search_knowledge: SandboxToolHandler = Arc::new(move |input: serde_json::Value| {
        let stores = Arc::clone(&h_stores);
        let project = h_project.clone();
        Box::pin(async move {
            let query = input["query"].as_str().unwrap_or_default().to_string();
            let top_k = input["top_k"].as_u64().unwrap_or(10) as usize;
            let store = stores.get(&project).await?;
            let hits = store
                .search(&query, top_k, SearchMode::Hybrid, None, None)
                .await;
            Ok(serde_json::to_value(json!({"hits": hits}))?)
        })
    });

    let h_stores = Arc::clone(stores);
    let h_project = project.clone();
    let h_model = Arc::clone(sub_model);
    let ask_knowledge: SandboxToolHandler = Arc::new(move |input: serde_json::Value| {
        let stores = Arc::clone(&h_stores);
        let project = h_project.clone();
        let model = Arc::clone(&h_model);
        Box::pin(async move {
            let question = input["question"].as_str().unwrap_or_default().to_string();
            let store = stores.get(&project).await?;
            let model_ref = (!ask_context_only).then(|| model.as_ref());
            let outcome = store
                .ask(&question, ask_context_only, None, model_ref)
                .await?;
            Ok(serde_json::to_value(outcome)?)
        })
    });

    let h_fetcher = Arc::clone(fetcher);
    let h_raw = raw_dir.clone();
    let fetch_url: SandboxToolHandler = Arc::new(move |input: serde_json::Value| {
        let fetcher = Arc::clone(&h_fetcher);
        let raw_dir = h_raw.clone();
        Box::pin(async move {
            let url = input["url"].as_str().unwrap_or_default().to_string();
            let outcome = fetcher.fetch(&raw_dir, &url, false).await;
            match outcome.error {
                None => Ok(json!({
                    "content": outcome.content,
                    "from_cache": outcome.from_cache,
                })),
                Some(failure) => Ok(json!({"error": failure.message, "error_kind": failure.error_kind})),
            }
        })
    });

    let load_file: SandboxToolHandler = Arc::new(move |input: serde_json::Value| {
        Box::pin(async move {
            let path = input["path"].as_str().unwrap_or_default().to_string();
            let var_name = input["var_name"].as_str().unwrap_or_default().to_string();
            let content = kernel_tools::read_host_file(&path).await?;
            Ok(json!({
                "var_name": var_name,
                "size": content.len(),
                "content": content,
            }))
        })
    });

    let h_stores = Arc::clone(stores);
    let h_project = project.clone();
    let apple_search: SandboxToolHandler = Arc::new(move |input: serde_json::Value| {
        let stores = Arc::clone(&h_stores);
        let project = h_project.clone();
        Box::pin(async move {
            let query = input["query"].as_str().unwrap_or_default().to_string();
            let framework = input["framework"].as_str().map(str::to_lowercase);
            let store = stores.get(&project).await?;
            let mut hits = store
                .search(&query, 10, SearchMode::Hybrid, None, Some("apple"))
                .await;
            if let Some(fw) = framework {
                hits.retain(|h| h.title.to_lowercase().contains(&fw));
            }
            Ok(serde_json::to_value(json!({"results": hits}))?)
        })
    });

    callback.register_tool("search_knowledge", search_knowledge);
    callback.register_tool("ask_knowledge", ask_knowledge);
    callback.register_tool("fetch_url", fetch_url);
    callback.register_tool("load_file", load_file);
    callback.register_tool("apple_search", apple_search);
}
