//! Per-model pricing and cumulative usage accounting.
//!
//! Cost of one call is `input_tokens * price_in + output_tokens * price_out`,
//! with prices quoted per million tokens.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::UsageInfo;

/// Per-model pricing for cost estimation (USD per 1M tokens).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens.
    pub input_per_million: f64,
    /// Price per 1M output tokens.
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Price an exchange.
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }

    /// Price an exchange from the service's usage report.
    pub fn usage(&self, usage: Option<&UsageInfo>) -> CompletionUsage {
        let input = usage.and_then(|u| u.prompt_tokens).unwrap_or(0);
        let output = usage.and_then(|u| u.completion_tokens).unwrap_or(0);
        CompletionUsage {
            input_tokens: input,
            output_tokens: output,
            cost_usd: self.estimate_cost(input, output),
        }
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::new(3.0, 15.0)
    }
}

/// Lookup approximate pricing for a model by name.
///
/// Matches on the segment after the last `/`, so `"deepseek/deepseek-chat"`
/// and `"deepseek-chat"` price the same.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    if name.contains("deepseek") && name.contains("reasoner") {
        ModelPricing::new(0.55, 2.19)
    } else if name.contains("deepseek") {
        ModelPricing::new(0.27, 1.10)
    } else if name.contains("gpt-4o-mini") || name.contains("4o-mini") {
        ModelPricing::new(0.15, 0.60)
    } else if name.contains("gpt-4o") || name.contains("gpt-4") {
        ModelPricing::new(2.50, 10.0)
    } else if name.contains("haiku") {
        ModelPricing::new(0.25, 1.25)
    } else if name.contains("opus") {
        ModelPricing::new(15.0, 75.0)
    } else {
        ModelPricing::default()
    }
}

/// Token counts and derived cost for one completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

impl CompletionUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Cumulative usage across a run, broken down by label (the phase that
/// made the call).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTracker {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    #[serde(default)]
    pub cost_by_phase: BTreeMap<String, f64>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one call's usage. Counters only grow.
    pub fn record(&mut self, label: &str, usage: &CompletionUsage) {
        self.total_input_tokens += usage.input_tokens as u64;
        self.total_output_tokens += usage.output_tokens as u64;
        let cost = usage.cost_usd.max(0.0);
        self.total_cost_usd += cost;
        *self.cost_by_phase.entry(label.to_string()).or_insert(0.0) += cost;
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }

    pub fn summary(&self) -> String {
        format!(
            "tokens: {} input + {} output = {} total, cost: ${:.4}",
            self.total_input_tokens,
            self.total_output_tokens,
            self.total_tokens(),
            self.total_cost_usd,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_estimation() {
        let pricing = ModelPricing::new(3.0, 15.0);
        let cost = pricing.estimate_cost(1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn deepseek_is_default_family() {
        let p = pricing_for_model("deepseek-chat");
        assert_eq!(p, ModelPricing::new(0.27, 1.10));
        assert_eq!(pricing_for_model("deepseek/deepseek-chat"), p);
        assert_eq!(pricing_for_model("mystery-model"), ModelPricing::default());
    }

    #[test]
    fn usage_from_report() {
        let usage = ModelPricing::new(1.0, 2.0).usage(Some(&UsageInfo::new(1_000_000, 500_000)));
        assert_eq!(usage.input_tokens, 1_000_000);
        assert_eq!(usage.total_tokens(), 1_500_000);
        assert!((usage.cost_usd - 2.0).abs() < 1e-9);

        let none = ModelPricing::default().usage(None);
        assert_eq!(none, CompletionUsage::default());
    }

    #[test]
    fn tracker_accumulates_per_phase() {
        let mut tracker = CostTracker::new();
        let u = CompletionUsage {
            input_tokens: 1000,
            output_tokens: 500,
            cost_usd: 0.01,
        };
        tracker.record("planning", &u);
        tracker.record("acting", &u);
        tracker.record("acting", &u);
        assert_eq!(tracker.total_input_tokens, 3000);
        assert_eq!(tracker.total_tokens(), 4500);
        assert!((tracker.cost_by_phase["acting"] - 0.02).abs() < 1e-12);
        assert!(tracker.summary().contains("cost: $0.0300"));
    }
}
