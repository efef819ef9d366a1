//! Budget module - model pricing and cost accounting.
//!
//! # Key Concepts
//! - Pricing: per (model, provider) token and media prices, optionally two-tier
//! - Cost: converts the usage reported by a provider call into USD

mod cost;
mod pricing;

pub use cost::{compute_cost, CostBreakdown};
pub use pricing::{MediaPrice, ModelPricing, ThresholdedPrices};
