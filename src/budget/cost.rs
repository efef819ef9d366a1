//! Usage to cost conversion.

use serde::{Deserialize, Serialize};

use super::{MediaPrice, ModelPricing};
use crate::llm::LlmUsage;

/// Cost of one provider call, in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub prompt_cost_usd: f64,
    pub completion_cost_usd: f64,
    pub image_cost_usd: f64,
    pub audio_cost_usd: f64,
}

impl CostBreakdown {
    pub fn total_usd(&self) -> f64 {
        self.prompt_cost_usd + self.completion_cost_usd + self.image_cost_usd + self.audio_cost_usd
    }
}

/// Two-tier cost: units up to `threshold` at `base`, units beyond it at `over`.
fn tiered(units: f64, base: f64, threshold: Option<(f64, f64)>) -> f64 {
    match threshold {
        Some((threshold, over)) if units > threshold => threshold * base + (units - threshold) * over,
        _ => units * base,
    }
}

fn media_cost(units: f64, price: &MediaPrice) -> f64 {
    let threshold = price.threshold.zip(price.cost_per_unit_over_threshold);
    tiered(units, price.cost_per_unit, threshold)
}

/// Compute the cost of a provider call from its usage.
///
/// Cached tokens are taken to be the leading part of the prompt, so they are priced in
/// the lower tier first.
pub fn compute_cost(usage: &LlmUsage, pricing: &ModelPricing) -> CostBreakdown {
    let prompt_tokens = usage.prompt_token_count.unwrap_or(0) as f64;
    let completion_tokens = usage.completion_token_count.unwrap_or(0) as f64;
    let cached_tokens = (usage.prompt_token_count_cached.unwrap_or(0) as f64).min(prompt_tokens);

    let prompt_tier = pricing
        .thresholded_prices
        .map(|t| (t.threshold as f64, t.prompt_cost_per_token_over_threshold));
    let completion_tier = pricing
        .thresholded_prices
        .map(|t| (t.threshold as f64, t.completion_cost_per_token_over_threshold));

    let discount = pricing.prompt_cached_tokens_discount.clamp(0.0, 1.0);
    let prompt_cost = tiered(prompt_tokens, pricing.prompt_cost_per_token, prompt_tier)
        - discount * tiered(cached_tokens, pricing.prompt_cost_per_token, prompt_tier);
    let completion_cost = tiered(completion_tokens, pricing.completion_cost_per_token, completion_tier);

    let image_cost = match (&pricing.image_price, usage.prompt_image_count) {
        (Some(price), Some(count)) => media_cost(count as f64, price),
        _ => 0.0,
    };
    let audio_cost = match (&pricing.audio_price, usage.prompt_audio_duration_seconds) {
        (Some(price), Some(seconds)) => media_cost(seconds.max(0.0), price),
        _ => 0.0,
    };

    CostBreakdown {
        prompt_cost_usd: prompt_cost,
        completion_cost_usd: completion_cost,
        image_cost_usd: image_cost,
        audio_cost_usd: audio_cost,
    }
}
