//! Bounded sub-agent loop: alternate main-model turns with kernel executions
//! until the model submits, a limit trips, or a terminal failure surfaces.

use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::callback::{UsageDelta, UsageLedger};
use crate::error::{BridgeError, BridgeResult};
use crate::kernel::{inject, KernelManager};
use crate::lm::LanguageModel;

use super::signature::Signature;

#[derive(Debug, Clone, Copy)]
pub struct SubAgentLimits {
    pub max_iterations: usize,
    pub max_llm_calls: usize,
    pub max_output_chars: usize,
}

impl Default for SubAgentLimits {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_llm_calls: 50,
            max_output_chars: 10_000,
        }
    }
}

/// One turn of a trajectory.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrajectoryStep {
    ModelTurn { content: String },
    KernelExecution { code: String },
    KernelOutput { output: String },
    Submission { outputs: serde_json::Value },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub error_kind: String,
    pub message: String,
}

/// Result of a sub-agent run. A terminal failure (limits, rate limiting,
/// kernel transport loss) sets `error` and leaves `outputs` empty; the
/// trajectory so far always rides along.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentRun {
    pub outputs: Option<serde_json::Value>,
    pub error: Option<RunFailure>,
    pub trajectory: Vec<TrajectoryStep>,
    pub iterations: usize,
    pub usage: UsageDelta,
}

pub struct SubAgentRunner {
    main_model: Arc<dyn LanguageModel>,
    kernel: Arc<KernelManager>,
    ledger: Arc<UsageLedger>,
    /// The kernel namespace is shared; one run at a time.
    run_gate: Mutex<()>,
}

impl SubAgentRunner {
    pub fn new(
        main_model: Arc<dyn LanguageModel>,
        kernel: Arc<KernelManager>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        Self {
            main_model,
            kernel,
            ledger,
            run_gate: Mutex::new(()),
        }
    }

    /// Drive one signature to completion. Malformed inputs are rejected
    /// before the loop starts.
    pub async fn run(
        &self,
        signature: &Signature,
        inputs: &serde_json::Map<String, serde_json::Value>,
        limits: SubAgentLimits,
    ) -> BridgeResult<SubAgentRun> {
        for field in &signature.input_fields {
            if !inputs.contains_key(&field.name) {
                return Err(BridgeError::Validation(format!(
                    "missing input field '{}'",
                    field.name
                )));
            }
        }

        let _running = self.run_gate.lock().await;
        self.kernel.ensure_running().await?;

        let usage_before = self.ledger.snapshot();
        let mut trajectory: Vec<TrajectoryStep> = Vec::new();
        let mut main_calls = 0usize;
        let mut iterations = 0usize;

        let terminal = |error_kind: &str,
                        message: String,
                        trajectory: Vec<TrajectoryStep>,
                        iterations: usize,
                        usage: UsageDelta| {
            Ok(SubAgentRun {
                outputs: None,
                error: Some(RunFailure {
                    error_kind: error_kind.into(),
                    message,
                }),
                trajectory,
                iterations,
                usage,
            })
        };

        loop {
            let sub_calls = self.ledger.snapshot().since(&usage_before).calls as usize;
            if main_calls + sub_calls >= limits.max_llm_calls {
                return terminal(
                    "sandbox_limit",
                    format!("language model call limit of {} exhausted", limits.max_llm_calls),
                    trajectory,
                    iterations,
                    self.ledger.snapshot().since(&usage_before),
                );
            }
            if iterations >= limits.max_iterations {
                return terminal(
                    "sandbox_limit",
                    format!("iteration limit of {} exhausted", limits.max_iterations),
                    trajectory,
                    iterations,
                    self.ledger.snapshot().since(&usage_before),
                );
            }
            iterations += 1;

            let prompt = render_prompt(signature, inputs, &trajectory);
            let completion = match self.main_model.complete(&prompt).await {
                Ok(c) => c,
                Err(BridgeError::RateLimited(msg)) => {
                    warn!("sub-agent main model rate limited");
                    return terminal(
                        "rate_limited",
                        msg,
                        trajectory,
                        iterations,
                        self.ledger.snapshot().since(&usage_before),
                    );
                }
                Err(e) => {
                    return terminal(
                        e.kind(),
                        e.to_string(),
                        trajectory,
                        iterations,
                        self.ledger.snapshot().since(&usage_before),
                    );
                }
            };
            main_calls += 1;
            trajectory.push(TrajectoryStep::ModelTurn {
                content: completion.text.clone(),
            });

            if let Some(code) = extract_code_block(&completion.text) {
                trajectory.push(TrajectoryStep::KernelExecution { code: code.clone() });
                match self
                    .kernel
                    .execute(&code, self.kernel.exec_timeout_secs())
                    .await
                {
                    Ok(outcome) => {
                        // Runtime errors stay in the trajectory for the model
                        // to react to.
                        let output = truncate(&outcome.combined(), limits.max_output_chars);
                        trajectory.push(TrajectoryStep::KernelOutput { output });
                    }
                    Err(e) => {
                        warn!(error = %e, "kernel call failed during sub-agent run");
                        return terminal(
                            e.kind(),
                            e.to_string(),
                            trajectory,
                            iterations,
                            self.ledger.snapshot().since(&usage_before),
                        );
                    }
                }
                continue;
            }

            match extract_submission(&completion.text) {
                Some(Ok(outputs)) => match validate_outputs(signature, &outputs) {
                    Ok(()) => {
                        trajectory.push(TrajectoryStep::Submission {
                            outputs: outputs.clone(),
                        });
                        // Best-effort: expose the result inside the kernel.
                        let store = inject::store_result_source(&outputs);
                        if let Err(e) = self.kernel.client().execute(&store, 10).await {
                            debug!(error = %e, "could not store sub-agent result in kernel");
                        }
                        info!(iterations, "sub-agent run submitted");
                        return Ok(SubAgentRun {
                            outputs: Some(outputs),
                            error: None,
                            trajectory,
                            iterations,
                            usage: self.ledger.snapshot().since(&usage_before),
                        });
                    }
                    Err(problem) => {
                        trajectory.push(TrajectoryStep::KernelOutput {
                            output: format!("submission rejected: {problem}"),
                        });
                    }
                },
                Some(Err(parse_err)) => {
                    trajectory.push(TrajectoryStep::KernelOutput {
                        output: format!("submission rejected: invalid JSON ({parse_err})"),
                    });
                }
                None => {
                    trajectory.push(TrajectoryStep::KernelOutput {
                        output: "reply contained neither a code block nor a SUBMIT line".into(),
                    });
                }
            }
        }
    }
}

fn render_prompt(
    signature: &Signature,
    inputs: &serde_json::Map<String, serde_json::Value>,
    trajectory: &[TrajectoryStep],
) -> String {
    let mut prompt = String::new();
    if !signature.instructions.is_empty() {
        prompt.push_str(&signature.instructions);
        prompt.push_str("\n\n");
    }
    prompt.push_str(
        "You are driving a persistent code kernel. The helpers llm_query(prompt), \
         llm_query_batch(prompts), search_knowledge(query), ask_knowledge(question), \
         and fetch_url(url) are defined in the namespace.\n\n",
    );

    prompt.push_str("Inputs:\n");
    for field in &signature.input_fields {
        let value = inputs.get(&field.name).cloned().unwrap_or_default();
        prompt.push_str(&format!("  {} = {}\n", field.name, value));
    }

    if !trajectory.is_empty() {
        prompt.push_str("\nTrajectory so far:\n");
        for step in trajectory {
            match step {
                TrajectoryStep::ModelTurn { content } => {
                    prompt.push_str(&format!("[you]\n{content}\n"));
                }
                TrajectoryStep::KernelExecution { code } => {
                    prompt.push_str(&format!("[executed]\n{code}\n"));
                }
                TrajectoryStep::KernelOutput { output } => {
                    prompt.push_str(&format!("[output]\n{output}\n"));
                }
                TrajectoryStep::Submission { .. } => {}
            }
        }
    }

    let fields = signature
        .output_fields
        .iter()
        .map(|f| format!("{}: {}", f.name, f.type_name))
        .collect::<Vec<_>>()
        .join(", ");
    prompt.push_str(&format!(
        "\nReply with exactly one of:\n\
         1. a fenced code block to execute next, or\n\
         2. the line SUBMIT followed by a JSON object with fields {{{fields}}}.\n"
    ));
    prompt
}

fn extract_code_block(text: &str) -> Option<String> {
    let re = Regex::new(r"(?s)```(?:python|py)?\n(.*?)```").expect("static regex");
    re.captures(text).map(|c| c[1].trim().to_string())
}

/// Find a `SUBMIT` line and parse the JSON object after it.
fn extract_submission(text: &str) -> Option<Result<serde_json::Value, serde_json::Error>> {
    let idx = text.find("SUBMIT")?;
    let rest = text[idx + "SUBMIT".len()..].trim_start_matches([':', ' ', '\n']);
    let start = rest.find('{')?;
    Some(serde_json::from_str(trim_to_balanced(&rest[start..])))
}

/// Cut the string at the brace that balances the opening one, tolerating
/// trailing prose after the JSON object.
fn trim_to_balanced(text: &str) -> &str {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return &text[..=i];
                }
            }
            _ => {}
        }
    }
    text
}

fn validate_outputs(signature: &Signature, outputs: &serde_json::Value) -> Result<(), String> {
    let Some(object) = outputs.as_object() else {
        return Err("expected a JSON object".into());
    };
    for field in &signature.output_fields {
        if !object.contains_key(&field.name) {
            return Err(format!("missing output field '{}'", field.name));
        }
    }
    for key in object.keys() {
        if !signature.output_fields.iter().any(|f| &f.name == key) {
            return Err(format!("unexpected output field '{key}'"));
        }
    }
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::lm::mock::ScriptedModel;
    use crate::subagent::signature::resolve;
    use wiremock::matchers::{method, path as urlpath};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_kernel() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(urlpath("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(urlpath("/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "output": "positive",
                "stderr": "",
                "vars": ["result"]
            })))
            .mount(&server)
            .await;
        server
    }

    fn manager_for(server: &MockServer) -> Arc<KernelManager> {
        Arc::new(KernelManager::new(
            KernelConfig {
                url: Some(server.uri()),
                ..KernelConfig::default()
            },
            reqwest::Client::new(),
        ))
    }

    fn inputs(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn code_then_submit_loop() {
        let kernel = mock_kernel().await;
        let model = Arc::new(ScriptedModel::new(vec![
            "```python\nresult = llm_query(\"classify sentiment of: I love this.\")\nprint(result)\n```",
            "SUBMIT\n{\"sentiment\": \"positive\"}",
        ]));
        let runner = SubAgentRunner::new(
            model,
            manager_for(&kernel),
            Arc::new(UsageLedger::new()),
        );

        let signature = resolve("text -> sentiment: str").unwrap();
        let run = runner
            .run(&signature, &inputs(&[("text", "I love this.")]), SubAgentLimits::default())
            .await
            .unwrap();

        assert!(run.error.is_none());
        assert_eq!(run.outputs.unwrap()["sentiment"], "positive");
        assert!(run.iterations >= 2);
        assert!(run
            .trajectory
            .iter()
            .any(|s| matches!(s, TrajectoryStep::KernelOutput { output } if output.contains("positive"))));
    }

    #[tokio::test]
    async fn missing_input_rejected_before_loop() {
        let kernel = mock_kernel().await;
        let model = Arc::new(ScriptedModel::new(vec![]));
        let runner = SubAgentRunner::new(model, manager_for(&kernel), Arc::new(UsageLedger::new()));

        let signature = resolve("text -> sentiment: str").unwrap();
        let err = runner
            .run(&signature, &inputs(&[]), SubAgentLimits::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn iteration_limit_surfaces_sandbox_limit() {
        let kernel = mock_kernel().await;
        // The model never submits.
        let model = Arc::new(ScriptedModel::new(vec!["```python\nprint(1)\n```"; 10]));
        let runner = SubAgentRunner::new(model, manager_for(&kernel), Arc::new(UsageLedger::new()));

        let signature = resolve("text -> sentiment: str").unwrap();
        let limits = SubAgentLimits {
            max_iterations: 3,
            ..SubAgentLimits::default()
        };
        let run = runner
            .run(&signature, &inputs(&[("text", "x")]), limits)
            .await
            .unwrap();

        let failure = run.error.unwrap();
        assert_eq!(failure.error_kind, "sandbox_limit");
        assert_eq!(run.iterations, 3);
        assert!(!run.trajectory.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_main_model_is_terminal() {
        struct RateLimited;
        #[async_trait::async_trait]
        impl LanguageModel for RateLimited {
            fn model_id(&self) -> &str {
                "rl"
            }
            async fn complete(&self, _p: &str) -> BridgeResult<crate::lm::Completion> {
                Err(BridgeError::RateLimited("try later".into()))
            }
        }

        let kernel = mock_kernel().await;
        let runner = SubAgentRunner::new(
            Arc::new(RateLimited),
            manager_for(&kernel),
            Arc::new(UsageLedger::new()),
        );
        let signature = resolve("text -> sentiment: str").unwrap();
        let run = runner
            .run(&signature, &inputs(&[("text", "x")]), SubAgentLimits::default())
            .await
            .unwrap();
        assert_eq!(run.error.unwrap().error_kind, "rate_limited");
    }

    #[tokio::test]
    async fn bad_submission_gets_a_retry_turn() {
        let kernel = mock_kernel().await;
        let model = Arc::new(ScriptedModel::new(vec![
            "SUBMIT\n{\"wrong_field\": 1}",
            "SUBMIT\n{\"sentiment\": \"neutral\"}",
        ]));
        let runner = SubAgentRunner::new(model, manager_for(&kernel), Arc::new(UsageLedger::new()));

        let signature = resolve("text -> sentiment: str").unwrap();
        let run = runner
            .run(&signature, &inputs(&[("text", "meh")]), SubAgentLimits::default())
            .await
            .unwrap();
        assert!(run.error.is_none());
        assert_eq!(run.outputs.unwrap()["sentiment"], "neutral");
        assert_eq!(run.iterations, 2);
    }

    #[tokio::test]
    async fn sub_model_calls_count_against_llm_budget() {
        let kernel = mock_kernel().await;
        let model = Arc::new(ScriptedModel::new(vec!["```python\nprint(1)\n```"; 10]));
        let ledger = Arc::new(UsageLedger::new());
        let runner = SubAgentRunner::new(model, manager_for(&kernel), Arc::clone(&ledger));

        let signature = resolve("text -> sentiment: str").unwrap();
        let limits = SubAgentLimits {
            max_iterations: 10,
            max_llm_calls: 2,
            ..SubAgentLimits::default()
        };
        let run = runner
            .run(&signature, &inputs(&[("text", "x")]), limits)
            .await
            .unwrap();
        let failure = run.error.unwrap();
        assert_eq!(failure.error_kind, "sandbox_limit");
        assert!(failure.message.contains("call limit"));
    }

    #[test]
    fn code_block_extraction() {
        assert_eq!(
            extract_code_block("before\n```python\nx = 1\n```\nafter").as_deref(),
            Some("x = 1")
        );
        assert_eq!(
            extract_code_block("```\nplain block\n```").as_deref(),
            Some("plain block")
        );
        assert!(extract_code_block("no code here").is_none());
    }

    #[test]
    fn submission_extraction_tolerates_trailing_prose() {
        let parsed = extract_submission("SUBMIT\n{\"a\": {\"b\": 1}}\nthanks!")
            .unwrap()
            .unwrap();
        assert_eq!(parsed["a"]["b"], 1);
        assert!(extract_submission("no marker").is_none());
    }

    #[test]
    fn truncate_appends_marker() {
        let long = "x".repeat(50);
        let cut = truncate(&long, 10);
        assert!(cut.starts_with("xxxxxxxxxx"));
        assert!(cut.ends_with("[truncated]"));
        assert_eq!(truncate("short", 10), "short");
    }
}
