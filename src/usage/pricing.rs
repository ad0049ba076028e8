//! Model pricing and cost estimation.
//!
//! Prices are USD per one million tokens. Versioned provider model names are
//! normalized onto a known family before lookup.

use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

/// Input/output price per one million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

const MODEL_PRICING: &[(&str, ModelPricing)] = &[
    ("gpt-4", ModelPricing { input: 30.0, output: 60.0 }),
    ("gpt-4-turbo", ModelPricing { input: 10.0, output: 30.0 }),
    ("gpt-3.5-turbo", ModelPricing { input: 0.5, output: 1.5 }),
    ("claude-3-opus", ModelPricing { input: 15.0, output: 75.0 }),
    ("claude-3-sonnet", ModelPricing { input: 3.0, output: 15.0 }),
    ("claude-3-haiku", ModelPricing { input: 0.25, output: 1.25 }),
];

fn version_suffix() -> &'static Regex {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    SUFFIX.get_or_init(|| {
        Regex::new(r"(-\d{4}(-\d{2}-\d{2})?|-\d{8}|-preview|-latest)+$").expect("valid suffix pattern")
    })
}

/// Map a raw provider model name onto the canonical pricing key.
///
/// Lowercases, trims, folds known families (`gpt-4-0613` -> `gpt-4`,
/// `claude-3-haiku-20240307` -> `claude-3-haiku`) and strips date or preview
/// suffixes from anything else.
pub fn normalize_model_name(model: &str) -> String {
    let name = model.trim().to_lowercase();
    if name.is_empty() {
        return name;
    }

    if name.contains("gpt-4-turbo") {
        return "gpt-4-turbo".to_string();
    }
    if name == "gpt-4" || name.starts_with("gpt-4-") {
        return "gpt-4".to_string();
    }
    if name.starts_with("gpt-3.5-turbo") {
        return "gpt-3.5-turbo".to_string();
    }
    for family in ["claude-3-opus", "claude-3-sonnet", "claude-3-haiku"] {
        if name.contains(family) {
            return family.to_string();
        }
    }

    version_suffix().replace(&name, "").into_owned()
}

/// Pricing for a model, if it belongs to a known family.
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    let canonical = normalize_model_name(model);
    MODEL_PRICING.iter().find(|(key, _)| *key == canonical).map(|(_, pricing)| *pricing)
}

/// Estimated dollar cost of one call, rounded to four decimals.
///
/// Unknown models cost zero and log a warning.
pub fn calculate_cost(model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let Some(pricing) = pricing_for(model) else {
        warn!("Unknown model for pricing: {} (normalized: {})", model, normalize_model_name(model));
        return 0.0;
    };

    let cost_in = tokens_in as f64 / 1_000_000.0 * pricing.input;
    let cost_out = tokens_out as f64 / 1_000_000.0 * pricing.output;
    ((cost_in + cost_out) * 10_000.0).round() / 10_000.0
}
