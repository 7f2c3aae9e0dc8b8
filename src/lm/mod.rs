//! Language-model clients.
//!
//! The bridge talks to two models: the main model driving sub-agent loops and
//! a cheaper sub-model serving `llm_query` callbacks and retrieval-augmented
//! answers. Both sit behind one trait so tests can script them.

pub mod anthropic;

pub use anthropic::AnthropicModel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BridgeResult;

/// Token counts reported by the model API for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One completed model call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// A single-completion language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, prompt: &str) -> BridgeResult<Completion>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Scripted model: pops pre-configured responses in order.
    pub struct ScriptedModel {
        responses: Mutex<Vec<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, prompt: &str) -> BridgeResult<Completion> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(crate::error::BridgeError::Unavailable(
                    "no more scripted responses".into(),
                ));
            }
            let text = responses.remove(0);
            Ok(Completion {
                usage: TokenUsage {
                    input_tokens: (prompt.len() / 4) as u64,
                    output_tokens: (text.len() / 4) as u64,
                },
                model: "scripted".into(),
                text,
            })
        }
    }
}
