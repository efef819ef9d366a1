//! Built-in model table.

use std::collections::HashMap;

use super::{CapabilityOverrides, Deprecation, ModelCapabilities, ModelData, ModelRegistry, ProviderModelData, RegistryError};
use crate::budget::{MediaPrice, ModelPricing};
use crate::llm::Provider;

fn entry(provider: Provider, pricing: ModelPricing) -> ProviderModelData {
    ProviderModelData {
        provider,
        provider_model_id: None,
        overrides: CapabilityOverrides::default(),
        pricing: Some(pricing),
    }
}

fn renamed(provider: Provider, provider_model_id: &str, pricing: ModelPricing) -> ProviderModelData {
    ProviderModelData {
        provider_model_id: Some(provider_model_id.to_string()),
        ..entry(provider, pricing)
    }
}

fn model(id: &str, display_name: &str, capabilities: ModelCapabilities, providers: Vec<ProviderModelData>) -> ModelData {
    ModelData {
        id: id.to_string(),
        display_name: display_name.to_string(),
        capabilities,
        providers,
        deprecation: None,
    }
}

fn deprecated(id: &str, replacement: &str) -> ModelData {
    ModelData {
        id: id.to_string(),
        display_name: id.to_string(),
        capabilities: ModelCapabilities::text_only(0, 0),
        providers: Vec::new(),
        deprecation: Some(Deprecation {
            replacement_model: Some(replacement.to_string()),
        }),
    }
}

const GPT_4O: ModelCapabilities = ModelCapabilities {
    supports_json_mode: true,
    supports_structured_output: true,
    supports_input_image: true,
    supports_multiple_images: true,
    supports_input_pdf: true,
    supports_input_audio: false,
    supports_tool_calling: true,
    max_input_tokens: 128_000,
    max_output_tokens: 16_384,
};

const GEMINI_15: ModelCapabilities = ModelCapabilities {
    supports_json_mode: true,
    supports_structured_output: true,
    supports_input_image: true,
    supports_multiple_images: true,
    supports_input_pdf: true,
    supports_input_audio: true,
    supports_tool_calling: true,
    max_input_tokens: 1_048_576,
    max_output_tokens: 8_192,
};

const CLAUDE_35: ModelCapabilities = ModelCapabilities {
    supports_json_mode: false,
    supports_structured_output: false,
    supports_input_image: true,
    supports_multiple_images: true,
    supports_input_pdf: true,
    supports_input_audio: false,
    supports_tool_calling: true,
    max_input_tokens: 200_000,
    max_output_tokens: 8_192,
};

fn gemini_flash_pricing() -> ModelPricing {
    ModelPricing::per_million(0.075, 0.30)
        .with_threshold(128_000, 0.15, 0.60)
        .with_cached_discount(0.75)
}

fn gemini_pro_pricing() -> ModelPricing {
    ModelPricing::per_million(1.25, 5.0)
        .with_threshold(128_000, 2.5, 10.0)
        .with_cached_discount(0.75)
}

impl ModelRegistry {
    /// Registry with the models known at build time. Validated before being returned.
    pub fn builtin() -> Result<Self, RegistryError> {
        let models = vec![
            model(
                "gpt-4o-2024-11-20",
                "GPT-4o (2024-11-20)",
                GPT_4O,
                vec![
                    entry(Provider::OpenAi, ModelPricing::per_million(2.5, 10.0).with_cached_discount(0.5)),
                    renamed(Provider::AzureOpenAi, "gpt-4o", ModelPricing::per_million(2.5, 10.0).with_cached_discount(0.5)),
                ],
            ),
            deprecated("gpt-4o-2024-08-06", "gpt-4o-2024-11-20"),
            model(
                "gpt-4o-mini-2024-07-18",
                "GPT-4o mini (2024-07-18)",
                GPT_4O,
                vec![
                    entry(Provider::OpenAi, ModelPricing::per_million(0.15, 0.6).with_cached_discount(0.5)),
                    renamed(Provider::AzureOpenAi, "gpt-4o-mini", ModelPricing::per_million(0.165, 0.66)),
                ],
            ),
            model(
                "gemini-1.5-flash-002",
                "Gemini 1.5 Flash (002)",
                GEMINI_15,
                vec![
                    ProviderModelData {
                        pricing: Some(
                            gemini_flash_pricing()
                                .with_image_price(MediaPrice::flat(0.00002))
                                .with_audio_price(MediaPrice::flat(0.000002)),
                        ),
                        ..entry(Provider::Google, gemini_flash_pricing())
                    },
                    entry(Provider::GoogleGemini, gemini_flash_pricing()),
                ],
            ),
            deprecated("gemini-1.5-flash-001", "gemini-1.5-flash-002"),
            model(
                "gemini-1.5-pro-002",
                "Gemini 1.5 Pro (002)",
                GEMINI_15,
                vec![
                    entry(Provider::Google, gemini_pro_pricing()),
                    entry(Provider::GoogleGemini, gemini_pro_pricing()),
                ],
            ),
            deprecated("gemini-1.5-pro-001", "gemini-1.5-pro-002"),
            model(
                "claude-3-5-sonnet-20241022",
                "Claude 3.5 Sonnet (2024-10-22)",
                CLAUDE_35,
                vec![
                    entry(Provider::Anthropic, ModelPricing::per_million(3.0, 15.0).with_cached_discount(0.9)),
                    ProviderModelData {
                        overrides: CapabilityOverrides {
                            supports_input_pdf: Some(false),
                            ..Default::default()
                        },
                        ..renamed(
                            Provider::AmazonBedrock,
                            "anthropic.claude-3-5-sonnet-20241022-v2:0",
                            ModelPricing::per_million(3.0, 15.0),
                        )
                    },
                ],
            ),
            model(
                "llama-3.3-70b",
                "Llama 3.3 (70B)",
                ModelCapabilities {
                    supports_tool_calling: true,
                    ..ModelCapabilities::text_only(128_000, 32_768)
                },
                vec![
                    renamed(Provider::Groq, "llama-3.3-70b-versatile", ModelPricing::per_million(0.59, 0.79)),
                    renamed(
                        Provider::Fireworks,
                        "accounts/fireworks/models/llama-v3p3-70b-instruct",
                        ModelPricing::per_million(0.9, 0.9),
                    ),
                ],
            ),
            deprecated("llama-3.1-70b", "llama-3.3-70b"),
            model(
                "mistral-large-2411",
                "Mistral Large (24.11)",
                ModelCapabilities {
                    supports_tool_calling: true,
                    ..ModelCapabilities::text_only(128_000, 8_192)
                },
                vec![entry(Provider::MistralAi, ModelPricing::per_million(2.0, 6.0))],
            ),
        ];

        let aliases = HashMap::from([
            ("gpt-4o-latest".to_string(), "gpt-4o-2024-11-20".to_string()),
            ("gpt-4o-mini-latest".to_string(), "gpt-4o-mini-2024-07-18".to_string()),
            ("gemini-1.5-flash-latest".to_string(), "gemini-1.5-flash-002".to_string()),
            ("gemini-1.5-pro-latest".to_string(), "gemini-1.5-pro-002".to_string()),
            ("claude-3-5-sonnet-latest".to_string(), "claude-3-5-sonnet-20241022".to_string()),
            ("mistral-large-latest".to_string(), "mistral-large-2411".to_string()),
        ]);

        Self::new(models, aliases)
    }
}
