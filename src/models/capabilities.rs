//! Model capability flags.

use serde::{Deserialize, Serialize};

/// What a (model, provider) pair supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub supports_json_mode: bool,
    #[serde(default)]
    pub supports_structured_output: bool,
    #[serde(default)]
    pub supports_input_image: bool,
    #[serde(default)]
    pub supports_multiple_images: bool,
    #[serde(default)]
    pub supports_input_pdf: bool,
    #[serde(default)]
    pub supports_input_audio: bool,
    #[serde(default)]
    pub supports_tool_calling: bool,
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
}

impl ModelCapabilities {
    /// Text-only model with JSON mode and nothing else.
    pub fn text_only(max_input_tokens: u64, max_output_tokens: u64) -> Self {
        Self {
            supports_json_mode: true,
            supports_structured_output: false,
            supports_input_image: false,
            supports_multiple_images: false,
            supports_input_pdf: false,
            supports_input_audio: false,
            supports_tool_calling: false,
            max_input_tokens,
            max_output_tokens,
        }
    }

    /// Apply provider specific overrides.
    pub fn with_overrides(mut self, overrides: &CapabilityOverrides) -> Self {
        macro_rules! apply {
            ($field:ident) => {
                if let Some(v) = overrides.$field {
                    self.$field = v;
                }
            };
        }
        apply!(supports_json_mode);
        apply!(supports_structured_output);
        apply!(supports_input_image);
        apply!(supports_multiple_images);
        apply!(supports_input_pdf);
        apply!(supports_input_audio);
        apply!(supports_tool_calling);
        apply!(max_input_tokens);
        apply!(max_output_tokens);
        self
    }
}

/// Subset of capabilities a provider changes relative to the model's canonical data,
/// e.g. a provider that drops PDF support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_json_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_structured_output: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_input_image: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_multiple_images: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_input_pdf: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_input_audio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_tool_calling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_only_touch_set_fields() {
        let mut base = ModelCapabilities::text_only(1000, 100);
        base.supports_input_pdf = true;
        let overridden = base.with_overrides(&CapabilityOverrides {
            supports_input_pdf: Some(false),
            max_output_tokens: Some(50),
            ..Default::default()
        });
        assert!(!overridden.supports_input_pdf);
        assert!(overridden.supports_json_mode);
        assert_eq!(overridden.max_input_tokens, 1000);
        assert_eq!(overridden.max_output_tokens, 50);
    }
}
