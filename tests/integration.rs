//! End-to-end scenarios across the host: fetch cascade, knowledge
//! round-trips, the sub-agent loop with a scripted model, and the callback
//! path a kernel stub would take.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use toolbridge::callback::{CallbackServer, SandboxToolHandler, UsageLedger};
use toolbridge::config::{FetchConfig, KernelConfig};
use toolbridge::error::{BridgeError, BridgeResult};
use toolbridge::fetch::Fetcher;
use toolbridge::kernel::KernelManager;
use toolbridge::knowledge::{HashedEmbedder, IngestRequest, KnowledgeStore, SearchMode};
use toolbridge::lm::{Completion, LanguageModel, TokenUsage};
use toolbridge::subagent::{signature, SubAgentLimits, SubAgentRunner, TrajectoryStep};

use wiremock::matchers::{header, method, path as urlpath};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ─── Scripted model (the mock-provider pattern, one per test) ───────────────

struct ScriptedModel {
    responses: std::sync::Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> BridgeResult<Completion> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(BridgeError::Unavailable("script exhausted".into()));
        }
        Ok(Completion {
            text: responses.remove(0),
            model: "scripted".into(),
            usage: TokenUsage {
                input_tokens: (prompt.len() / 4) as u64,
                output_tokens: 8,
            },
        })
    }
}

fn markdown_body(title: &str) -> String {
    format!("# {title}\n\n{}\n\n- first\n- second\n", "prose text ".repeat(30))
}

async fn open_store(dir: &std::path::Path) -> KnowledgeStore {
    KnowledgeStore::open(dir, "itest", Arc::new(HashedEmbedder::default()))
        .await
        .unwrap()
}

// ─── Cascade scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn cascade_negotiated_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(urlpath("/docs/search"))
        .and(header("accept", "text/markdown"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/markdown")
                .set_body_string(markdown_body("Search API")),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let fetcher = Fetcher::new(reqwest::Client::new(), FetchConfig::default());

    let url = format!("{}/docs/search", server.uri());
    let raw = dir.path().join("raw");
    let outcome = fetcher.fetch(&raw, &url, false).await;

    assert!(!outcome.from_cache);
    let meta = outcome.meta.clone().unwrap();
    assert_eq!(meta.markdown_source, "negotiated");
    assert!(outcome.path.as_ref().unwrap().exists());

    // Ingest exactly one document, findable by a heading keyword.
    let report = store
        .ingest(
            IngestRequest::new(&url, "itest-lib", outcome.content.clone().unwrap())
                .with_metadata(serde_json::to_value(&meta).unwrap()),
        )
        .await
        .unwrap();
    assert!(!report.deduplicated);
    assert_eq!(store.status().await.doc_count, 1);

    let hits = store
        .search("Search API", 5, SearchMode::Lexical, None, None)
        .await;
    assert_eq!(hits[0].title, url);
}

#[tokio::test]
async fn cascade_proxy_fallback_makes_exactly_two_requests() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<!DOCTYPE html><html><body><p>html only</p></body></html>"),
        )
        .mount(&target)
        .await;

    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(markdown_body("Proxied")))
        .mount(&proxy)
        .await;

    let fetcher = Fetcher::new(
        reqwest::Client::new(),
        FetchConfig {
            proxy_base: proxy.uri(),
            ..FetchConfig::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let url = format!("{}/page", target.uri());
    let outcome = fetcher.fetch(dir.path(), &url, false).await;

    assert_eq!(outcome.meta.unwrap().markdown_source, "markdown_new");
    assert_eq!(target.received_requests().await.unwrap().len(), 1);
    assert_eq!(proxy.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn cascade_full_fallback_converts_html() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(
                    "<!DOCTYPE html><html><body><h1>Converted Title</h1>\
                     <p>Paragraph body.</p></body></html>",
                ),
        )
        .mount(&target)
        .await;
    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&proxy)
        .await;

    let fetcher = Fetcher::new(
        reqwest::Client::new(),
        FetchConfig {
            proxy_base: proxy.uri(),
            ..FetchConfig::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let url = format!("{}/page", target.uri());
    let outcome = fetcher.fetch(dir.path(), &url, false).await;

    assert_eq!(outcome.meta.unwrap().markdown_source, "html2text");
    let content = outcome.content.unwrap();
    assert!(content.lines().any(|l| l.starts_with("# ")), "{content}");
}

#[tokio::test]
async fn blocked_hostname_variants_all_refused() {
    let fetcher = Fetcher::new(reqwest::Client::new(), FetchConfig::default());
    let dir = tempfile::tempdir().unwrap();
    for url in [
        "https://medium.com/post",
        "https://www.medium.com/post",
        "https://docs.medium.com/post",
    ] {
        let outcome = fetcher.fetch(dir.path(), url, false).await;
        assert_eq!(
            outcome.error.unwrap().error_kind,
            "blocked",
            "{url} should be blocked"
        );
    }
}

// ─── Knowledge round-trips ──────────────────────────────────────────────────

#[tokio::test]
async fn ingest_search_title_top_hit() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    for i in 0..20 {
        store
            .ingest(IngestRequest::new(
                format!("filler-{i}"),
                "kb",
                format!("ordinary filler document number {i}"),
            ))
            .await
            .unwrap();
    }
    store
        .ingest(IngestRequest::new(
            "quantum-entanglement",
            "kb",
            "notes about quantum entanglement experiments",
        ))
        .await
        .unwrap();

    let hits = store
        .search("quantum entanglement", 10, SearchMode::Lexical, None, None)
        .await;
    assert_eq!(hits[0].title, "quantum-entanglement");
}

#[tokio::test]
async fn duplicate_and_clear_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    store
        .ingest(IngestRequest::new("a", "kb", "identical content"))
        .await
        .unwrap();
    store
        .ingest(IngestRequest::new("b", "kb", "identical content"))
        .await
        .unwrap();
    assert_eq!(store.status().await.doc_count, 1);

    store.clear().await.unwrap();
    store.clear().await.unwrap();
    assert_eq!(store.status().await.doc_count, 0);
}

#[tokio::test]
async fn thread_filter_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    for (title, thread) in [("a1", "A"), ("a2", "A"), ("b1", "B")] {
        store
            .ingest(
                IngestRequest::new(title, "kb", format!("shared corpus term for {title}"))
                    .with_thread(Some(thread.into())),
            )
            .await
            .unwrap();
    }

    let b_only = store
        .search("shared corpus term", 10, SearchMode::Hybrid, Some("B"), None)
        .await;
    assert_eq!(b_only.len(), 1);
    assert_eq!(b_only[0].title, "b1");

    let all = store
        .search("shared corpus term", 10, SearchMode::Hybrid, None, None)
        .await;
    assert_eq!(all.len(), 3);
}

// ─── Sub-agent loop + callback path ─────────────────────────────────────────

fn kernel_manager(server: &MockServer) -> Arc<KernelManager> {
    Arc::new(KernelManager::new(
        KernelConfig {
            url: Some(server.uri()),
            ..KernelConfig::default()
        },
        reqwest::Client::new(),
    ))
}

async fn mock_kernel(exec_output: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(urlpath("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(urlpath("/exec"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": exec_output,
            "stderr": "",
            "vars": ["result"]
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn sub_agent_sentiment_scenario() {
    // The model writes code that calls llm_query; in production the injected
    // stub POSTs that prompt to the callback server. Here the stub's HTTP
    // call is driven explicitly against a live callback server while the
    // kernel itself is mocked.
    let mut callback = CallbackServer::new(
        0,
        1024 * 1024,
        Arc::new(ScriptedModel::new(vec!["positive"])),
    );
    callback.start().await.unwrap();
    let ledger = callback.ledger();

    let callback_url = format!("http://127.0.0.1:{}/llm_query", callback.port());
    let kernel_side: serde_json::Value = reqwest::Client::new()
        .post(&callback_url)
        .json(&json!({"prompt": "classify sentiment of: I love this."}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(kernel_side["response"], "positive");

    let kernel = mock_kernel("positive").await;
    let main_model = Arc::new(ScriptedModel::new(vec![
        "```python\nresult = llm_query(\"classify sentiment of: I love this.\")\nprint(result)\n```",
        "SUBMIT\n{\"sentiment\": \"positive\"}",
    ]));
    let runner = SubAgentRunner::new(main_model, kernel_manager(&kernel), Arc::clone(&ledger));

    let sig = signature::resolve("text -> sentiment: str").unwrap();
    let inputs = json!({"text": "I love this."})
        .as_object()
        .cloned()
        .unwrap();
    let run = runner
        .run(&sig, &inputs, SubAgentLimits::default())
        .await
        .unwrap();

    assert!(run.error.is_none());
    assert_eq!(run.outputs.unwrap()["sentiment"], "positive");
    assert!(run.iterations >= 2);

    // The callback call above happened before the run window, so it must not
    // be attributed to the run; the cumulative ledger still holds it.
    assert_eq!(ledger.snapshot().total_calls, 1);

    callback.stop().await;
}

#[tokio::test]
async fn sub_agent_usage_attributes_callback_traffic_in_window() {
    let mut callback = CallbackServer::new(
        0,
        1024 * 1024,
        Arc::new(ScriptedModel::new(vec!["positive"])),
    );
    callback.start().await.unwrap();
    let ledger = callback.ledger();
    let callback_url = format!("http://127.0.0.1:{}/llm_query", callback.port());

    // A model whose code turn triggers a real callback POST mid-run.
    struct CallbackDrivingModel {
        callback_url: String,
        turn: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl LanguageModel for CallbackDrivingModel {
        fn model_id(&self) -> &str {
            "driver"
        }

        async fn complete(&self, _prompt: &str) -> BridgeResult<Completion> {
            let turn = {
                let mut t = self.turn.lock().unwrap();
                *t += 1;
                *t
            };
            let text = if turn == 1 {
                // Mirror what the injected llm_query stub does in the kernel.
                let client = reqwest::Client::new();
                let _ = client
                    .post(&self.callback_url)
                    .json(&json!({"prompt": "classify sentiment of: I love this."}))
                    .send()
                    .await;
                "```python\nprint(result)\n```".to_string()
            } else {
                "SUBMIT\n{\"sentiment\": \"positive\"}".to_string()
            };
            Ok(Completion {
                text,
                model: "driver".into(),
                usage: TokenUsage::default(),
            })
        }
    }

    let kernel = mock_kernel("positive").await;
    let runner = SubAgentRunner::new(
        Arc::new(CallbackDrivingModel {
            callback_url,
            turn: std::sync::Mutex::new(0),
        }),
        kernel_manager(&kernel),
        Arc::clone(&ledger),
    );

    let sig = signature::resolve("text -> sentiment: str").unwrap();
    let inputs = json!({"text": "I love this."})
        .as_object()
        .cloned()
        .unwrap();
    let run = runner
        .run(&sig, &inputs, SubAgentLimits::default())
        .await
        .unwrap();

    assert!(run.error.is_none());
    assert!(run.usage.calls >= 1, "in-window callback usage missing");
    callback.stop().await;
}

#[tokio::test]
async fn sub_agent_terminates_within_bounds() {
    let kernel = mock_kernel("looping").await;
    // A model that always emits code and never submits.
    let responses = vec!["```python\nprint('again')\n```"; 100];
    let runner = SubAgentRunner::new(
        Arc::new(ScriptedModel::new(responses)),
        kernel_manager(&kernel),
        Arc::new(UsageLedger::new()),
    );

    let sig = signature::resolve("text -> answer: str").unwrap();
    let inputs = json!({"text": "x"}).as_object().cloned().unwrap();
    let limits = SubAgentLimits {
        max_iterations: 5,
        max_llm_calls: 50,
        max_output_chars: 100,
    };
    let run = runner.run(&sig, &inputs, limits).await.unwrap();

    assert_eq!(run.error.unwrap().error_kind, "sandbox_limit");
    assert_eq!(run.iterations, 5);
    // Trajectory alternates model turns and kernel steps; bounded overall.
    assert!(run.trajectory.len() <= 3 * 5);
    assert!(run
        .trajectory
        .iter()
        .any(|s| matches!(s, TrajectoryStep::KernelExecution { .. })));
}

#[tokio::test]
async fn programmatic_tool_call_from_kernel_stays_host_side() {
    // Kernel code calls search_knowledge(...); the callback dispatches to the
    // knowledge store and the hits exist only in the callback response, never
    // on the client transport.
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open_store(dir.path()).await);
    for i in 0..3 {
        store
            .ingest(IngestRequest::new(
                format!("doc-{i}"),
                "kb",
                format!("searchable corpus entry number {i} about xylophones"),
            ))
            .await
            .unwrap();
    }

    let mut callback = CallbackServer::new(0, 1024 * 1024, Arc::new(ScriptedModel::new(vec![])));
    let handler_store = Arc::clone(&store);
    let handler: SandboxToolHandler = Arc::new(move |input: serde_json::Value| {
        let store = Arc::clone(&handler_store);
        Box::pin(async move {
            let query = input["query"].as_str().unwrap_or_default().to_string();
            let top_k = input["top_k"].as_u64().unwrap_or(10) as usize;
            let hits = store
                .search(&query, top_k, SearchMode::Lexical, None, None)
                .await;
            Ok(serde_json::to_value(json!({"hits": hits}))?)
        })
    });
    callback.register_tool("search_knowledge", handler);
    callback.start().await.unwrap();

    let url = format!("http://127.0.0.1:{}/tool_call", callback.port());
    let body: serde_json::Value = reqwest::Client::new()
        .post(&url)
        .json(&json!({"tool": "search_knowledge", "input": {"query": "xylophones", "top_k": 3}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["result"]["hits"].as_array().unwrap().len(), 3);

    // Mutating tools are refused from the sandbox.
    let refused = reqwest::Client::new()
        .post(&url)
        .json(&json!({"tool": "ingest", "input": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status().as_u16(), 403);

    callback.stop().await;
}

#[tokio::test]
async fn ledger_monotonic_until_reset() {
    let mut callback = CallbackServer::new(
        0,
        1024 * 1024,
        Arc::new(ScriptedModel::new(vec!["a", "b", "c"])),
    );
    callback.start().await.unwrap();
    let ledger = callback.ledger();
    let url = format!("http://127.0.0.1:{}/llm_query", callback.port());

    let client = reqwest::Client::new();
    let mut last_calls = 0;
    for prompt in ["one", "two", "three"] {
        client
            .post(&url)
            .json(&json!({"prompt": prompt}))
            .send()
            .await
            .unwrap();
        let snap = ledger.snapshot();
        assert!(snap.total_calls > last_calls);
        last_calls = snap.total_calls;
    }

    ledger.reset();
    assert_eq!(ledger.snapshot().total_calls, 0);
    callback.stop().await;
}
