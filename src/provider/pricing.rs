//! Price tables and cost estimation
//!
//! Prices are USD per 1000 tokens. Lookup order for a (provider, model) pair:
//! provider override for the exact model, then the built-in table by exact
//! name, then by longest built-in prefix (so dated snapshots such as
//! `claude-3-opus-20240229` price as `claude-3-opus`). Unknown models are
//! charged at the highest known rates so estimates never undershoot.

use crate::config::{ModelPrice, ProviderConfig};
use crate::gateway::Message;
use std::collections::HashMap;

const BUILTIN: &[(&str, f64, f64)] = &[
    ("gpt-4", 0.03, 0.06),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-3.5-turbo", 0.0015, 0.002),
    ("claude-3-opus", 0.015, 0.075),
    ("claude-3-sonnet", 0.003, 0.015),
    ("claude-3-haiku", 0.00025, 0.00125),
    ("claude-2", 0.008, 0.024),
    ("gemini-pro", 0.0005, 0.0015),
];

/// Turns a request into an estimated cost and usage into an actual one
pub trait CostEstimator: Send + Sync {
    /// Pre-flight estimate: prompt tokens at the input price plus the full
    /// `max_tokens` allowance at the output price
    fn estimate(&self, provider: &str, model: &str, messages: &[Message], max_tokens: u32) -> f64;

    /// Cost of a completed call from reported token counts
    fn actual(&self, provider: &str, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64;
}

/// Rough prompt size: four characters per token, rounded up
pub fn estimate_tokens(messages: &[Message]) -> u32 {
    let chars: usize = messages
        .iter()
        .map(|m| m.role.chars().count() + m.content.chars().count())
        .sum();
    chars.div_ceil(4) as u32
}

#[derive(Debug, Clone)]
pub struct PriceTable {
    builtin: HashMap<String, ModelPrice>,
    overrides: HashMap<String, HashMap<String, ModelPrice>>,
    ceiling: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        let builtin: HashMap<String, ModelPrice> = BUILTIN
            .iter()
            .map(|(model, input, output)| {
                (
                    model.to_string(),
                    ModelPrice {
                        input_per_1k: *input,
                        output_per_1k: *output,
                    },
                )
            })
            .collect();
        let mut table = Self {
            builtin,
            overrides: HashMap::new(),
            ceiling: ModelPrice {
                input_per_1k: 0.0,
                output_per_1k: 0.0,
            },
        };
        table.recompute_ceiling();
        table
    }
}

impl PriceTable {
    /// Built-in prices plus each provider's `models` overrides
    pub fn from_providers(providers: &HashMap<String, ProviderConfig>) -> Self {
        let mut table = Self::default();
        for (name, config) in providers {
            if !config.models.is_empty() {
                table.overrides.insert(name.clone(), config.models.clone());
            }
        }
        table.recompute_ceiling();
        table
    }

    pub fn with_price(mut self, provider: &str, model: &str, price: ModelPrice) -> Self {
        self.overrides
            .entry(provider.to_string())
            .or_default()
            .insert(model.to_string(), price);
        self.recompute_ceiling();
        self
    }

    fn recompute_ceiling(&mut self) {
        let all = self
            .builtin
            .values()
            .chain(self.overrides.values().flat_map(|m| m.values()));
        let (input, output) = all.fold((0.0f64, 0.0f64), |(i, o), p| {
            (i.max(p.input_per_1k), o.max(p.output_per_1k))
        });
        self.ceiling = ModelPrice {
            input_per_1k: input,
            output_per_1k: output,
        };
    }

    pub fn price(&self, provider: &str, model: &str) -> ModelPrice {
        if let Some(price) = self.overrides.get(provider).and_then(|m| m.get(model)) {
            return *price;
        }
        if let Some(price) = self.builtin.get(model) {
            return *price;
        }
        self.builtin
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| *price)
            .unwrap_or(self.ceiling)
    }

    pub fn is_known(&self, provider: &str, model: &str) -> bool {
        self.overrides
            .get(provider)
            .is_some_and(|m| m.contains_key(model))
            || self.builtin.keys().any(|name| model.starts_with(name.as_str()))
    }
}

fn cost(price: ModelPrice, input_tokens: u32, output_tokens: u32) -> f64 {
    (input_tokens as f64 / 1000.0) * price.input_per_1k
        + (output_tokens as f64 / 1000.0) * price.output_per_1k
}

impl CostEstimator for PriceTable {
    fn estimate(&self, provider: &str, model: &str, messages: &[Message], max_tokens: u32) -> f64 {
        cost(self.price(provider, model), estimate_tokens(messages), max_tokens)
    }

    fn actual(&self, provider: &str, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        cost(self.price(provider, model), prompt_tokens, completion_tokens)
    }
}
