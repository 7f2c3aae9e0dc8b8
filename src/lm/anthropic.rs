//! Anthropic Messages API client for single completions.
//!
//! The credential is read from `ANTHROPIC_API_KEY` at request time so it
//! never lives in config files or snapshots.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{BridgeError, BridgeResult};

use super::{Completion, LanguageModel, TokenUsage};

const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicModel {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl AnthropicModel {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn api_key() -> BridgeResult<String> {
        std::env::var(API_KEY_ENV)
            .map_err(|_| BridgeError::Unavailable(format!("{API_KEY_ENV} is not set")))
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> BridgeResult<Completion> {
        let api_key = Self::api_key()?;

        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BridgeError::RateLimited(format!(
                "model {} is rate limited",
                self.model
            )));
        }
        if status.as_u16() == 529 || status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(BridgeError::Unavailable("model API is overloaded".into()));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BridgeError::Transport(format!(
                "model API returned HTTP {}: {}",
                status.as_u16(),
                detail.chars().take(200).collect::<String>()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BridgeError::Internal(format!("unexpected model response: {e}")))?;

        let text = payload["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = TokenUsage {
            input_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0),
        };

        Ok(Completion {
            text,
            model: payload["model"]
                .as_str()
                .unwrap_or(&self.model)
                .to_string(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // Serializes the tests that mutate the process environment.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[tokio::test]
    async fn completes_and_reports_usage() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(API_KEY_ENV, "test-key");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "claude-haiku-4-5-20251001",
                "content": [{"type": "text", "text": "positive"}],
                "usage": {"input_tokens": 12, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let model = AnthropicModel::new(
            reqwest::Client::new(),
            server.uri(),
            "claude-haiku-4-5-20251001",
        );
        let completion = model.complete("classify: I love this").await.unwrap();
        assert_eq!(completion.text, "positive");
        assert_eq!(completion.usage.input_tokens, 12);
        assert_eq!(completion.usage.output_tokens, 3);

        std::env::remove_var(API_KEY_ENV);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_rate_limited() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(API_KEY_ENV, "test-key");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let model = AnthropicModel::new(reqwest::Client::new(), server.uri(), "m");
        let err = model.complete("x").await.unwrap_err();
        assert_eq!(err.kind(), "rate_limited");

        std::env::remove_var(API_KEY_ENV);
    }

    #[tokio::test]
    async fn missing_credential_is_unavailable() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(API_KEY_ENV);

        let model = AnthropicModel::new(reqwest::Client::new(), "http://127.0.0.1:1", "m");
        let err = model.complete("x").await.unwrap_err();
        assert_eq!(err.kind(), "unavailable");
        assert!(err.to_string().contains(API_KEY_ENV));
    }

    #[tokio::test]
    async fn multiple_text_blocks_concatenate() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(API_KEY_ENV, "test-key");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "m",
                "content": [
                    {"type": "text", "text": "part one, "},
                    {"type": "text", "text": "part two"}
                ],
                "usage": {"input_tokens": 1, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let model = AnthropicModel::new(reqwest::Client::new(), server.uri(), "m");
        assert_eq!(model.complete("x").await.unwrap().text, "part one, part two");

        std::env::remove_var(API_KEY_ENV);
    }
}
