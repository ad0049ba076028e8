//! Token counting for LLM-call events.
//!
//! Providers do not always report usage. [`TokenCounter`] estimates it with tiktoken's
//! `cl100k_base` encoding and falls back to a four-characters-per-token heuristic when
//! the encoding cannot be loaded.

use serde_json::Value;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Per-message formatting overhead added by chat templates
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Counts tokens in prompts, completions and chat transcripts.
///
/// # Examples
///
/// ```
/// use runscope::usage::TokenCounter;
///
/// let counter = TokenCounter::heuristic();
/// assert_eq!(counter.count("abcdefgh"), 2);
/// ```
#[derive(Clone)]
pub struct TokenCounter {
    encoding: Option<Arc<CoreBPE>>,
}

impl TokenCounter {
    /// Counter backed by the named tiktoken encoding.
    ///
    /// Supported encodings are `cl100k_base`, `p50k_base` and `r50k_base`. Any other
    /// name, or a failure to load the encoding, yields a heuristic counter.
    pub fn new(encoding: &str) -> Self {
        let loaded = match encoding {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => {
                warn!("Unsupported encoding {}, estimating tokens from length", other);
                return Self::heuristic();
            }
        };

        match loaded {
            Ok(bpe) => Self {
                encoding: Some(Arc::new(bpe)),
            },
            Err(e) => {
                warn!("Failed to load {} encoding ({}), estimating tokens from length", encoding, e);
                Self::heuristic()
            }
        }
    }

    /// Counter that always uses the length heuristic.
    pub fn heuristic() -> Self {
        Self { encoding: None }
    }

    pub fn is_exact(&self) -> bool {
        self.encoding.is_some()
    }

    /// Count tokens in `text`. Empty text is zero tokens.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match &self.encoding {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => estimate_tokens_fallback(text),
        }
    }

    /// Estimate tokens for ChatML-style messages (`role`, `content`, `name`).
    ///
    /// Non-object entries are skipped; non-string content is counted on its JSON text.
    pub fn count_messages(&self, messages: &[Value]) -> usize {
        let mut total = 0;
        for message in messages {
            let Some(fields) = message.as_object() else {
                debug!("Skipping non-object chat message");
                continue;
            };

            total += MESSAGE_OVERHEAD_TOKENS;
            for key in ["role", "content", "name"] {
                match fields.get(key) {
                    Some(Value::String(s)) => total += self.count(s),
                    Some(Value::Null) | None => {}
                    Some(other) => total += self.count(&other.to_string()),
                }
            }
        }
        total
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new("cl100k_base")
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").field("exact", &self.is_exact()).finish()
    }
}

/// Rough estimate when no tokenizer is available: four characters per token.
pub fn estimate_tokens_fallback(text: &str) -> usize {
    text.chars().count() / 4
}
