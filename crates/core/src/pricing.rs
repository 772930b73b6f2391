// crates/core/src/pricing.rs
//! Token accounting and cost calculation.
//!
//! A small per-model rate table with prefix fallback covers the models the
//! supported CLIs actually run. Costs are advisory (display), computed the
//! same way for both adapters.

use serde::{Deserialize, Serialize};

/// Per-model rates in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

/// Sonnet-class fallback for unknown models.
const FALLBACK_RATES: ModelRates = ModelRates {
    input: 3.0,
    output: 15.0,
    cache_write: 3.75,
    cache_read: 0.30,
};

/// Rate table keyed by model-id prefix. Longest prefix wins.
const RATE_TABLE: &[(&str, ModelRates)] = &[
    (
        "claude-opus-4",
        ModelRates {
            input: 15.0,
            output: 75.0,
            cache_write: 18.75,
            cache_read: 1.50,
        },
    ),
    (
        "claude-sonnet-4",
        ModelRates {
            input: 3.0,
            output: 15.0,
            cache_write: 3.75,
            cache_read: 0.30,
        },
    ),
    (
        "claude-haiku-4",
        ModelRates {
            input: 1.0,
            output: 5.0,
            cache_write: 1.25,
            cache_read: 0.10,
        },
    ),
    (
        "claude-3-5-haiku",
        ModelRates {
            input: 0.80,
            output: 4.0,
            cache_write: 1.0,
            cache_read: 0.08,
        },
    ),
];

/// Look up rates for a model id, longest matching prefix first.
///
/// Provider-qualified ids ("anthropic/claude-sonnet-4-5") match on the part
/// after the slash. Unknown models fall back to sonnet-class rates.
pub fn model_rates(model: &str) -> ModelRates {
    let bare = model.rsplit('/').next().unwrap_or(model);
    RATE_TABLE
        .iter()
        .filter(|(prefix, _)| bare.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, rates)| *rates)
        .unwrap_or(FALLBACK_RATES)
}

/// Cost in USD for one message's token counts.
pub fn message_cost(
    model: Option<&str>,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_tokens: u64,
    cache_read_tokens: u64,
) -> f64 {
    let rates = model.map(model_rates).unwrap_or(FALLBACK_RATES);
    const M: f64 = 1_000_000.0;
    input_tokens as f64 / M * rates.input
        + output_tokens as f64 / M * rates.output
        + cache_creation_tokens as f64 / M * rates.cache_write
        + cache_read_tokens as f64 / M * rates.cache_read
}

/// Aggregated token usage and cost for a session.
///
/// Field names match the wire format consumed by clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub message_count: u64,
    pub cost: f64,
    pub models: Vec<String>,
}

impl TokenUsage {
    /// Record a model id once, preserving first-seen order.
    pub fn add_model(&mut self, model: &str) {
        if !self.models.iter().any(|m| m == model) {
            self.models.push(model.to_string());
        }
    }
}

/// Estimate output tokens from rendered content length.
///
/// The JSON-lines transcripts repeat per-chunk output counts that do not sum
/// to anything meaningful, so per-message display numbers are estimated at
/// ~4 characters per token. Never used for session totals.
pub fn estimate_output_tokens(content_chars: usize) -> u64 {
    (content_chars as u64).div_ceil(4)
}
