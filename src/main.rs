//! Command line entry point.
//!
//! Usage: `agentrun <request.json> [config.json]`
//!
//! The request holds the task schemas, the input, the run properties and an optional
//! `stream` flag. The output JSON (or one SSE line per stream event) goes to stdout,
//! logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use agentrun::{AgentRunner, EngineConfig, RunProperties, TaskVariant, ToolCallCache, ToolRegistry};

#[derive(Debug, Deserialize)]
struct RunRequest {
    task: TaskVariant,
    #[serde(default)]
    input: Value,
    properties: RunProperties,
    #[serde(default)]
    stream: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agentrun=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(request_path) = args.next().map(PathBuf::from) else {
        bail!("usage: agentrun <request.json> [config.json]");
    };
    let config_path = args.next().map(PathBuf::from);

    let request = read_request(&request_path)?;
    let config = EngineConfig::load_or_env(config_path.as_deref())?;
    let runner = AgentRunner::from_config(config, ToolRegistry::new())?;

    let task = request.task.with_computed_id();
    let cache = ToolCallCache::new();

    if request.stream {
        let mut events = runner.run_stream(task, request.input, request.properties, cache);
        let mut failed = false;
        while let Some(event) = events.next().await {
            failed = matches!(event, agentrun::StreamEvent::Error(_));
            print!("{}", event.to_sse());
        }
        if failed {
            std::process::exit(1);
        }
        return Ok(());
    }

    match runner.run(&task, &request.input, &request.properties, &cache).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.to_payload())?);
            std::process::exit(1);
        }
    }
}

fn read_request(path: &Path) -> anyhow::Result<RunRequest> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request {}", path.display()))?;
    let request: RunRequest = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse request {}", path.display()))?;
    request.properties.validate()?;
    Ok(request)
}
