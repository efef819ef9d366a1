//! Per-provider model pricing data.

use serde::{Deserialize, Serialize};

/// Token prices above a usage threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdedPrices {
    /// Tokens up to and including this count use the base rate.
    pub threshold: u64,
    pub prompt_cost_per_token_over_threshold: f64,
    pub completion_cost_per_token_over_threshold: f64,
}

/// Price of a unit of media (one image, one second of audio).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaPrice {
    pub cost_per_unit: f64,
    /// Units above this count are billed at `cost_per_unit_over_threshold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_unit_over_threshold: Option<f64>,
}

impl MediaPrice {
    pub fn flat(cost_per_unit: f64) -> Self {
        Self {
            cost_per_unit,
            threshold: None,
            cost_per_unit_over_threshold: None,
        }
    }
}

/// Pricing of one model served by one provider. All costs are in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_cost_per_token: f64,
    pub completion_cost_per_token: f64,
    /// Fraction in [0, 1] taken off the price of cached prompt tokens.
    #[serde(default)]
    pub prompt_cached_tokens_discount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholded_prices: Option<ThresholdedPrices>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_price: Option<MediaPrice>,
    /// Price per second of input audio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_price: Option<MediaPrice>,
}

impl ModelPricing {
    pub fn per_million(prompt: f64, completion: f64) -> Self {
        Self {
            prompt_cost_per_token: prompt / 1_000_000.0,
            completion_cost_per_token: completion / 1_000_000.0,
            prompt_cached_tokens_discount: 0.0,
            thresholded_prices: None,
            image_price: None,
            audio_price: None,
        }
    }

    pub fn with_cached_discount(mut self, discount: f64) -> Self {
        self.prompt_cached_tokens_discount = discount;
        self
    }

    /// Prices per million tokens above `threshold` tokens.
    pub fn with_threshold(mut self, threshold: u64, prompt: f64, completion: f64) -> Self {
        self.thresholded_prices = Some(ThresholdedPrices {
            threshold,
            prompt_cost_per_token_over_threshold: prompt / 1_000_000.0,
            completion_cost_per_token_over_threshold: completion / 1_000_000.0,
        });
        self
    }

    pub fn with_image_price(mut self, price: MediaPrice) -> Self {
        self.image_price = Some(price);
        self
    }

    pub fn with_audio_price(mut self, price: MediaPrice) -> Self {
        self.audio_price = Some(price);
        self
    }

    /// Problems with the pricing data, if any.
    pub fn validate(&self) -> Result<(), String> {
        let rates = [
            self.prompt_cost_per_token,
            self.completion_cost_per_token,
            self.thresholded_prices.map_or(0.0, |t| t.prompt_cost_per_token_over_threshold),
            self.thresholded_prices.map_or(0.0, |t| t.completion_cost_per_token_over_threshold),
            self.image_price.map_or(0.0, |p| p.cost_per_unit),
            self.audio_price.map_or(0.0, |p| p.cost_per_unit),
        ];
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err("costs must be finite and non-negative".to_string());
        }
        if !(0.0..=1.0).contains(&self.prompt_cached_tokens_discount) {
            return Err(format!(
                "cached token discount {} is outside [0, 1]",
                self.prompt_cached_tokens_discount
            ));
        }
        for media in [self.image_price, self.audio_price].into_iter().flatten() {
            if media.threshold.is_some() != media.cost_per_unit_over_threshold.is_some() {
                return Err("media threshold and over-threshold cost must be set together".to_string());
            }
        }
        Ok(())
    }
}
