//! Adapter seam between agent frameworks and the event model.
//!
//! Frameworks describe their work in their own types. An [`EventExtractor`] maps one
//! of those values to typed [`EventData`] records; the tracer never inspects
//! framework objects itself.

use crate::event::{EventData, LlmCall};
use crate::usage::{calculate_cost, TokenCounter};
use serde_json::Value;

/// Maps a framework-native value to event records.
pub trait EventExtractor {
    type Source: ?Sized;

    /// Records describing `source`, in the order they should be recorded.
    fn extract(&self, source: &Self::Source) -> Vec<EventData>;
}

/// Extracts an LLM call from a chat completion response body.
///
/// Understands both the `choices`/`prompt_tokens` shape and the
/// `content`/`input_tokens` shape. Token counts missing from the response are estimated
/// from the text when a [`TokenCounter`] is configured.
#[derive(Debug, Default)]
pub struct ChatCompletionExtractor {
    counter: Option<TokenCounter>,
    prompt: Option<String>,
}

impl ChatCompletionExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Prompt text to attach to extracted calls, since responses do not echo it.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

fn completion_text(response: &Value) -> Option<String> {
    if let Some(content) = response["choices"][0]["message"]["content"].as_str() {
        return Some(content.to_string());
    }

    let blocks = response["content"].as_array()?;
    let text: Vec<&str> = blocks.iter().filter_map(|block| block["text"].as_str()).collect();
    (!text.is_empty()).then(|| text.join(""))
}

fn usage_tokens(response: &Value, keys: [&str; 2]) -> u64 {
    keys.iter()
        .find_map(|key| response["usage"][*key].as_u64())
        .unwrap_or(0)
}

impl EventExtractor for ChatCompletionExtractor {
    type Source = Value;

    fn extract(&self, response: &Value) -> Vec<EventData> {
        let Some(model) = response["model"].as_str() else {
            return Vec::new();
        };

        let mut call = LlmCall::new(model).with_usage(
            usage_tokens(response, ["prompt_tokens", "input_tokens"]),
            usage_tokens(response, ["completion_tokens", "output_tokens"]),
        );
        if let Some(prompt) = &self.prompt {
            call = call.with_prompt(prompt.clone());
        }
        if let Some(completion) = completion_text(response) {
            call = call.with_completion(completion);
        }

        let call = match &self.counter {
            Some(counter) => call.with_estimated_usage(counter),
            None => {
                let cost = calculate_cost(&call.model, call.tokens_in, call.tokens_out);
                call.with_cost(cost)
            }
        };
        vec![call.into()]
    }
}
