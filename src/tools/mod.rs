//! Tool registry and per-run tool call cache.
//!
//! Tools are external: the engine only knows their name, description and parameter
//! schema, and how to call them. A tool returning an error never aborts a run; the
//! error text is handed back to the model.

mod cache;

pub use cache::ToolCallCache;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::llm::ToolDefinition;

/// An executable tool offered to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments.
    fn parameters_schema(&self) -> Value;

    /// Run the tool with the arguments the model provided.
    async fn execute(&self, args: Value) -> anyhow::Result<String>;
}

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync;

/// Tool backed by a closure.
pub struct FnTool {
    name: String,
    description: String,
    parameters: Value,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, parameters: Value, func: F) -> Self
    where
        F: Fn(Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        (self.func)(args).await
    }
}

/// Maps tool names to tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Restrict the registry to the enabled tools. Unknown names are logged and skipped.
    pub fn subset(&self, enabled: &BTreeSet<String>) -> ToolRegistry {
        let mut tools = HashMap::new();
        for name in enabled {
            match self.tools.get(name) {
                Some(tool) => {
                    tools.insert(name.clone(), tool.clone());
                }
                None => tracing::warn!("Enabled tool {} is not registered", name),
            }
        }
        ToolRegistry { tools }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions sent to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(&name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.names()).finish()
    }
}
