//! Pricing table and cost computation for model and tool calls.
//!
//! Rates are expressed per 1K tokens for models and per call for tools.
//! All arithmetic uses [`Decimal`] so accumulated costs stay exact.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

const TOKENS_PER_RATE_UNIT: Decimal = dec!(1000);

/// Pricing for a single model, per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

impl ModelPricing {
    pub const fn new(input_per_1k: Decimal, output_per_1k: Decimal) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> Decimal {
        let input = Decimal::from(prompt_tokens) / TOKENS_PER_RATE_UNIT * self.input_per_1k;
        let output = Decimal::from(completion_tokens) / TOKENS_PER_RATE_UNIT * self.output_per_1k;
        input + output
    }
}

/// Pricing for a single tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPricing {
    #[serde(default)]
    pub cost_per_call: Decimal,
}

/// Central pricing table for models and tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    models: HashMap<String, ModelPricing>,
    #[serde(default)]
    tools: HashMap<String, ToolPricing>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            models: HashMap::new(),
            tools: HashMap::new(),
        }
    }
}

impl PricingTable {
    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::default()
    }

    /// Looks up a model's pricing, trying an exact match first and then a
    /// prefix match so versioned names (`gpt-4o-2024-08-06`) resolve to
    /// their base entry.
    pub fn model_pricing(&self, model: &str) -> Option<&ModelPricing> {
        if let Some(pricing) = self.models.get(model) {
            return Some(pricing);
        }
        self.models
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, pricing)| pricing)
    }

    /// Cost of a completed model call.
    ///
    /// A model missing from the table costs 0 and logs a warning; pricing
    /// gaps must never block or misprice a run.
    pub fn model_call_cost(
        &self,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Decimal {
        match self.model_pricing(model) {
            Some(pricing) => pricing.cost(prompt_tokens, completion_tokens),
            None => {
                warn!(model, "no pricing entry for model, recording zero cost");
                Decimal::ZERO
            }
        }
    }

    /// Cost of a tool call; unpriced tools are free.
    pub fn tool_call_cost(&self, tool: &str) -> Decimal {
        self.tools
            .get(tool)
            .map(|p| p.cost_per_call)
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    currency: Option<String>,
    models: HashMap<String, ModelPricing>,
    tools: HashMap<String, ToolPricing>,
}

impl PricingTableBuilder {
    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn model(
        mut self,
        name: impl Into<String>,
        input_per_1k: Decimal,
        output_per_1k: Decimal,
    ) -> Self {
        self.models
            .insert(name.into(), ModelPricing::new(input_per_1k, output_per_1k));
        self
    }

    pub fn tool(mut self, name: impl Into<String>, cost_per_call: Decimal) -> Self {
        self.tools.insert(name.into(), ToolPricing { cost_per_call });
        self
    }

    /// Seeds pricing for common hosted models.
    pub fn with_defaults(mut self) -> Self {
        let defaults = [
            ("gpt-4o", dec!(2.50), dec!(10.00)),
            ("gpt-4o-mini", dec!(0.15), dec!(0.60)),
            ("gpt-4.1", dec!(5.00), dec!(15.00)),
            ("gpt-4.1-mini", dec!(0.40), dec!(1.60)),
            ("claude-3-opus", dec!(15.00), dec!(75.00)),
            ("claude-3.5-sonnet", dec!(3.00), dec!(15.00)),
            ("claude-3.5-haiku", dec!(0.80), dec!(4.00)),
            ("gemini-1.5-pro", dec!(3.50), dec!(10.50)),
            ("gemini-1.5-flash", dec!(0.075), dec!(0.30)),
        ];
        for (name, input, output) in defaults {
            self.models
                .insert(name.to_string(), ModelPricing::new(input, output));
        }
        self
    }

    pub fn build(self) -> PricingTable {
        PricingTable {
            currency: self.currency.unwrap_or_else(default_currency),
            models: self.models,
            tools: self.tools,
        }
    }
}
