//! Loopback HTTP server the kernel calls back into.
//!
//! Two routes: `POST /llm_query` forwards a prompt to the sub-model and
//! meters usage; `POST /tool_call` dispatches a whitelisted, read-only tool.
//! The kernel reaches this server on `127.0.0.1:<port>` (bare tier) or
//! `host.docker.internal:<port>` (container tier), so the listener binds all
//! interfaces while the tool surface itself stays host-side.

pub mod ledger;

pub use ledger::{UsageDelta, UsageLedger, UsageSnapshot};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::lm::LanguageModel;

/// Async handler for one sandbox-callable tool.
pub type SandboxToolHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, BridgeResult<serde_json::Value>> + Send + Sync>;

/// Lifecycle states of the callback server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Started = 0,
    Ready = 1,
    Draining = 2,
    Stopped = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerState::Started,
            1 => ServerState::Ready,
            2 => ServerState::Draining,
            _ => ServerState::Stopped,
        }
    }
}

#[derive(Clone)]
struct CallbackState {
    sub_model: Arc<dyn LanguageModel>,
    ledger: Arc<UsageLedger>,
    tools: Arc<HashMap<String, SandboxToolHandler>>,
    state: Arc<AtomicU8>,
}

pub struct CallbackServer {
    sub_model: Arc<dyn LanguageModel>,
    ledger: Arc<UsageLedger>,
    tools: HashMap<String, SandboxToolHandler>,
    state: Arc<AtomicU8>,
    body_limit: usize,
    port: u16,
    bound_port: Option<u16>,
    shutdown_tx: Option<watch::Sender<bool>>,
    serve_task: Option<tokio::task::JoinHandle<()>>,
}

impl CallbackServer {
    pub fn new(port: u16, body_limit: usize, sub_model: Arc<dyn LanguageModel>) -> Self {
        Self {
            sub_model,
            ledger: Arc::new(UsageLedger::new()),
            tools: HashMap::new(),
            state: Arc::new(AtomicU8::new(ServerState::Started as u8)),
            body_limit,
            port,
            bound_port: None,
            shutdown_tx: None,
            serve_task: None,
        }
    }

    pub fn ledger(&self) -> Arc<UsageLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Port actually bound (differs from the configured one when it was 0).
    pub fn port(&self) -> u16 {
        self.bound_port.unwrap_or(self.port)
    }

    /// Register a sandbox-callable tool. Registration is the whitelist:
    /// anything not registered is refused at dispatch.
    pub fn register_tool(&mut self, name: impl Into<String>, handler: SandboxToolHandler) {
        self.tools.insert(name.into(), handler);
    }

    pub async fn start(&mut self) -> BridgeResult<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| {
                BridgeError::Unavailable(format!("cannot bind callback port {}: {e}", self.port))
            })?;
        self.bound_port = Some(listener.local_addr()?.port());

        let state = CallbackState {
            sub_model: Arc::clone(&self.sub_model),
            ledger: Arc::clone(&self.ledger),
            tools: Arc::new(self.tools.clone()),
            state: Arc::clone(&self.state),
        };

        let app = Router::new()
            .route("/llm_query", post(handle_llm_query))
            .route("/tool_call", post(handle_tool_call))
            .layer(middleware::from_fn_with_state(state.clone(), refuse_when_draining))
            .layer(RequestBodyLimitLayer::new(self.body_limit))
            .with_state(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        let state_flag = Arc::clone(&self.state);
        let port = self.port();

        self.serve_task = Some(tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "callback server exited with error");
            }
            state_flag.store(ServerState::Stopped as u8, Ordering::SeqCst);
        }));

        self.state.store(ServerState::Ready as u8, Ordering::SeqCst);
        info!(port, tools = self.tools.len(), "callback server ready");
        Ok(())
    }

    /// Drain: refuse new calls, await in-flight ones, then stop.
    pub async fn stop(&mut self) {
        self.state.store(ServerState::Draining as u8, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.serve_task.take() {
            let _ = task.await;
        }
        self.state.store(ServerState::Stopped as u8, Ordering::SeqCst);
        info!("callback server stopped");
    }
}

async fn refuse_when_draining(
    State(state): State<CallbackState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    match ServerState::from_u8(state.state.load(Ordering::SeqCst)) {
        ServerState::Ready => next.run(request).await,
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "callback server is draining"})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct LlmQueryBody {
    #[serde(default)]
    prompt: String,
}

async fn handle_llm_query(
    State(state): State<CallbackState>,
    Json(body): Json<LlmQueryBody>,
) -> Response {
    if body.prompt.is_empty() {
        return error_response(&BridgeError::Validation("missing prompt".into()));
    }
    match state.sub_model.complete(&body.prompt).await {
        Ok(completion) => {
            state.ledger.record(&completion.model, completion.usage);
            (
                StatusCode::OK,
                Json(json!({
                    "response": completion.text,
                    "usage": {
                        "input_tokens": completion.usage.input_tokens,
                        "output_tokens": completion.usage.output_tokens,
                    }
                })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "llm_query callback failed");
            error_response(&e)
        }
    }
}

#[derive(Deserialize)]
struct ToolCallBody {
    #[serde(default)]
    tool: String,
    #[serde(default)]
    input: serde_json::Value,
}

async fn handle_tool_call(
    State(state): State<CallbackState>,
    Json(body): Json<ToolCallBody>,
) -> Response {
    if body.tool.is_empty() {
        return error_response(&BridgeError::Validation("missing tool name".into()));
    }
    let Some(handler) = state.tools.get(&body.tool) else {
        return error_response(&BridgeError::Blocked(format!(
            "tool '{}' is not callable from the sandbox",
            body.tool
        )));
    };
    match handler(body.input).await {
        Ok(result) => (StatusCode::OK, Json(json!({"result": result}))).into_response(),
        Err(e) => {
            warn!(tool = %body.tool, error = %e, "tool_call callback failed");
            error_response(&e)
        }
    }
}

fn error_response(err: &BridgeError) -> Response {
    let status = match err.kind() {
        "validation" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "blocked" => StatusCode::FORBIDDEN,
        "timeout" => StatusCode::REQUEST_TIMEOUT,
        "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        "unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"error": err.to_string(), "error_kind": err.kind()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::mock::ScriptedModel;

    async fn running_server(responses: Vec<&str>) -> (CallbackServer, String) {
        let mut server = CallbackServer::new(0, 1024 * 1024, Arc::new(ScriptedModel::new(responses)));
        server.register_tool(
            "search_knowledge",
            Arc::new(|input: serde_json::Value| {
                Box::pin(async move {
                    let query = input["query"].as_str().unwrap_or_default().to_string();
                    Ok(json!({"hits": [{"title": "doc", "query": query}]}))
                })
            }),
        );
        server.start().await.unwrap();
        let url = format!("http://127.0.0.1:{}", server.port());
        (server, url)
    }

    #[tokio::test]
    async fn llm_query_returns_response_and_meters() {
        let (mut server, url) = running_server(vec!["positive"]).await;
        let ledger = server.ledger();

        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post(format!("{url}/llm_query"))
            .json(&json!({"prompt": "classify sentiment of: I love this."}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["response"], "positive");
        assert!(body["usage"]["input_tokens"].as_u64().unwrap() > 0);
        let snap = ledger.snapshot();
        assert_eq!(snap.total_calls, 1);
        assert!(snap.calls_by_model.contains_key("scripted"));

        server.stop().await;
    }

    #[tokio::test]
    async fn empty_prompt_is_bad_request() {
        let (mut server, url) = running_server(vec![]).await;
        let response = reqwest::Client::new()
            .post(format!("{url}/llm_query"))
            .json(&json!({"prompt": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        server.stop().await;
    }

    #[tokio::test]
    async fn tool_call_dispatches_whitelisted_tool() {
        let (mut server, url) = running_server(vec![]).await;
        let body: serde_json::Value = reqwest::Client::new()
            .post(format!("{url}/tool_call"))
            .json(&json!({"tool": "search_knowledge", "input": {"query": "x", "top_k": 3}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["result"]["hits"][0]["query"], "x");
        server.stop().await;
    }

    #[tokio::test]
    async fn unregistered_tool_is_forbidden() {
        let (mut server, url) = running_server(vec![]).await;
        for tool in ["execute", "reset", "sub_agent", "ingest"] {
            let response = reqwest::Client::new()
                .post(format!("{url}/tool_call"))
                .json(&json!({"tool": tool, "input": {}}))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), 403, "{tool} must be refused");
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["error_kind"], "blocked");
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn rate_limited_sub_model_maps_to_429() {
        // ScriptedModel returns Unavailable when empty; use one that rates.
        struct RateLimited;
        #[async_trait::async_trait]
        impl LanguageModel for RateLimited {
            fn model_id(&self) -> &str {
                "rl"
            }
            async fn complete(&self, _p: &str) -> BridgeResult<crate::lm::Completion> {
                Err(BridgeError::RateLimited("slow down".into()))
            }
        }

        let mut server = CallbackServer::new(0, 1024, Arc::new(RateLimited));
        server.start().await.unwrap();
        let url = format!("http://127.0.0.1:{}", server.port());
        let response = reqwest::Client::new()
            .post(format!("{url}/llm_query"))
            .json(&json!({"prompt": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 429);
        server.stop().await;
    }

    #[tokio::test]
    async fn lifecycle_states_progress() {
        let (mut server, url) = running_server(vec![]).await;
        assert_eq!(server.state(), ServerState::Ready);
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);

        // Stopped server refuses connections entirely.
        let result = reqwest::Client::new()
            .post(format!("{url}/tool_call"))
            .json(&json!({"tool": "search_knowledge", "input": {}}))
            .send()
            .await;
        assert!(result.is_err() || !result.unwrap().status().is_success());
    }
}
