// ABOUTME: Entry point for the handbox binary.
// ABOUTME: Loads config from the environment, builds the engine, and runs one capability request read from stdin.

use std::io::Read;

use anyhow::Context;
use serde::Deserialize;

use handbox_agent::{CapabilityMap, Engine, HandboxConfig};

/// One capability call, e.g. `{"capability": "agent.react", "input": {"goal": "..."}}`.
#[derive(Debug, Deserialize)]
struct Request {
    capability: String,
    #[serde(default)]
    input: CapabilityMap,
    #[serde(default)]
    config: CapabilityMap,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("handbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = HandboxConfig::from_env().context("invalid handbox configuration")?;
    tracing::info!(default_provider = %config.default_provider, "handbox starting up");
    let engine = Engine::from_config(&config).await;

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read request from stdin")?;
    let request: Request =
        serde_json::from_str(&raw).context("request must be JSON with a 'capability' field")?;

    let ctx = engine.context();
    tracing::info!(capability = %request.capability, trace_id = %ctx.trace_id, "running capability");
    let outcome = engine
        .invoke(&request.capability, &request.input, &request.config, &ctx)
        .await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
