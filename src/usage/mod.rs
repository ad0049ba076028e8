//! Usage estimation for LLM calls: token counts and dollar cost.

pub mod pricing;
pub mod tokens;

pub use pricing::{calculate_cost, normalize_model_name, pricing_for, ModelPricing};
pub use tokens::{estimate_tokens_fallback, TokenCounter};
