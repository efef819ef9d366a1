//! Upstream provider identifiers.

use serde::{Deserialize, Serialize};

/// An upstream LLM API that can serve one or more models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure_openai")]
    AzureOpenAi,
    Anthropic,
    AmazonBedrock,
    /// Vertex AI
    Google,
    /// Gemini API (AI Studio)
    GoogleGemini,
    Groq,
    Fireworks,
    #[serde(rename = "mistral_ai")]
    MistralAi,
}

impl Provider {
    pub const ALL: [Provider; 9] = [
        Provider::OpenAi,
        Provider::AzureOpenAi,
        Provider::Anthropic,
        Provider::AmazonBedrock,
        Provider::Google,
        Provider::GoogleGemini,
        Provider::Groq,
        Provider::Fireworks,
        Provider::MistralAi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::AzureOpenAi => "azure_openai",
            Self::Anthropic => "anthropic",
            Self::AmazonBedrock => "amazon_bedrock",
            Self::Google => "google",
            Self::GoogleGemini => "google_gemini",
            Self::Groq => "groq",
            Self::Fireworks => "fireworks",
            Self::MistralAi => "mistral_ai",
        }
    }

    /// Environment variable holding the API key for this provider.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::AzureOpenAi => "AZURE_OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::AmazonBedrock => "AWS_BEDROCK_API_KEY",
            Self::Google => "GOOGLE_VERTEX_API_KEY",
            Self::GoogleGemini => "GEMINI_API_KEY",
            Self::Groq => "GROQ_API_KEY",
            Self::Fireworks => "FIREWORKS_API_KEY",
            Self::MistralAi => "MISTRAL_API_KEY",
        }
    }

    /// Base URL of the provider's OpenAI-compatible chat completions API, if it has one.
    pub fn openai_compatible_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("https://api.openai.com/v1"),
            Self::GoogleGemini => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Self::Groq => Some("https://api.groq.com/openai/v1"),
            Self::Fireworks => Some("https://api.fireworks.ai/inference/v1"),
            Self::MistralAi => Some("https://api.mistral.ai/v1"),
            Self::AzureOpenAi | Self::Anthropic | Self::AmazonBedrock | Self::Google => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
