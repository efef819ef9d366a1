use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RunError;
use crate::llm::Provider;

/// Whether to ask providers for schema-constrained generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredGenerationMode {
    /// Use it when the provider supports it, fall back once if it fails.
    #[default]
    Auto,
    ForceOn,
    ForceOff,
}

/// An input/output pair shown to the model as an example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub input: Value,
    pub output: Value,
}

/// Per-run configuration. Construct through [`RunProperties::builder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProperties {
    model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider: Option<Provider>,
    #[serde(default)]
    temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    enabled_tools: BTreeSet<String>,
    #[serde(default)]
    is_chain_of_thought_enabled: bool,
    #[serde(default)]
    few_shot_examples: Vec<FewShotExample>,
    #[serde(default)]
    structured_generation: StructuredGenerationMode,
}

impl RunProperties {
    pub fn builder(model: impl Into<String>) -> RunPropertiesBuilder {
        RunPropertiesBuilder {
            props: RunProperties {
                model: model.into(),
                provider: None,
                temperature: 0.0,
                max_tokens: None,
                instructions: String::new(),
                enabled_tools: BTreeSet::new(),
                is_chain_of_thought_enabled: false,
                few_shot_examples: Vec::new(),
                structured_generation: StructuredGenerationMode::Auto,
            },
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> Option<Provider> {
        self.provider
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn max_tokens(&self) -> Option<u64> {
        self.max_tokens
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn enabled_tools(&self) -> &BTreeSet<String> {
        &self.enabled_tools
    }

    pub fn is_chain_of_thought_enabled(&self) -> bool {
        self.is_chain_of_thought_enabled
    }

    pub fn few_shot_examples(&self) -> &[FewShotExample] {
        &self.few_shot_examples
    }

    pub fn structured_generation(&self) -> StructuredGenerationMode {
        self.structured_generation
    }

    /// Check values that deserialization alone cannot enforce.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.model.trim().is_empty() {
            return Err(RunError::InvalidRunProperties("model is empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RunError::InvalidRunProperties(format!(
                "temperature {} is outside [0, 2]",
                self.temperature
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(RunError::InvalidRunProperties("max_tokens must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`RunProperties`]. The built value has no setters.
#[derive(Debug, Clone)]
pub struct RunPropertiesBuilder {
    props: RunProperties,
}

impl RunPropertiesBuilder {
    pub fn provider(mut self, provider: Provider) -> Self {
        self.props.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.props.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.props.max_tokens = Some(max_tokens);
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.props.instructions = instructions.into();
        self
    }

    pub fn tool(mut self, name: impl Into<String>) -> Self {
        self.props.enabled_tools.insert(name.into());
        self
    }

    pub fn tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.props.enabled_tools.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn chain_of_thought(mut self, enabled: bool) -> Self {
        self.props.is_chain_of_thought_enabled = enabled;
        self
    }

    pub fn few_shot_example(mut self, input: Value, output: Value) -> Self {
        self.props.few_shot_examples.push(FewShotExample { input, output });
        self
    }

    pub fn structured_generation(mut self, mode: StructuredGenerationMode) -> Self {
        self.props.structured_generation = mode;
        self
    }

    pub fn build(self) -> Result<RunProperties, RunError> {
        self.props.validate()?;
        Ok(self.props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_defaults() {
        let props = RunProperties::builder("gpt-4o-latest").build().unwrap();
        assert_eq!(props.model(), "gpt-4o-latest");
        assert_eq!(props.structured_generation(), StructuredGenerationMode::Auto);
        assert_eq!(props.temperature(), 0.0);
        assert!(props.enabled_tools().is_empty());
    }

    #[test]
    fn test_builder_rejects_bad_temperature() {
        let err = RunProperties::builder("m").temperature(3.0).build().unwrap_err();
        assert_eq!(err.code(), "invalid_run_properties");
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let props: RunProperties = serde_json::from_value(json!({
            "model": "gemini-1.5-flash-latest",
            "provider": "google_gemini",
            "enabled_tools": ["search"],
            "structured_generation": "force_off"
        }))
        .unwrap();
        assert_eq!(props.provider(), Some(Provider::GoogleGemini));
        assert!(props.enabled_tools().contains("search"));
        assert_eq!(props.structured_generation(), StructuredGenerationMode::ForceOff);
    }
}
