use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// USD per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub prompt: f64,
    pub completion: f64,
}

const FALLBACK_MODEL: &str = "gpt-4";

const BUILTIN_PRICES: &[(&str, ModelPrice)] = &[
    (
        "gpt-4",
        ModelPrice {
            prompt: 0.03,
            completion: 0.06,
        },
    ),
    (
        "gpt-4-turbo",
        ModelPrice {
            prompt: 0.01,
            completion: 0.03,
        },
    ),
    (
        "gpt-3.5-turbo",
        ModelPrice {
            prompt: 0.0015,
            completion: 0.002,
        },
    ),
    (
        "deepseek-chat",
        ModelPrice {
            prompt: 0.00014,
            completion: 0.00028,
        },
    ),
    (
        "deepseek-coder",
        ModelPrice {
            prompt: 0.00014,
            completion: 0.00028,
        },
    ),
];

#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    prices: BTreeMap<String, ModelPrice>,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            prices: BUILTIN_PRICES
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
        }
    }
}

impl PriceTable {
    /// Built-in table with configured entries layered on top.
    pub fn with_overrides(overrides: &BTreeMap<String, ModelPrice>) -> Self {
        let mut table = Self::default();
        for (model, price) in overrides {
            table.prices.insert(model.clone(), *price);
        }
        table
    }

    /// Unknown models are priced as gpt-4.
    pub fn price_for(&self, model_id: &str) -> ModelPrice {
        self.prices
            .get(model_id)
            .or_else(|| self.prices.get(FALLBACK_MODEL))
            .copied()
            .unwrap_or(ModelPrice {
                prompt: 0.03,
                completion: 0.06,
            })
    }

    pub fn is_known(&self, model_id: &str) -> bool {
        self.prices.contains_key(model_id)
    }

    pub fn estimate_cost(&self, model_id: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let price = self.price_for(model_id);
        prompt_tokens as f64 / 1000.0 * price.prompt
            + completion_tokens as f64 / 1000.0 * price.completion
    }
}
