//! # vsm
//!
//! Command-line entry point: one-shot chat against the configured provider,
//! or a stdio tool server exposing the built-in and mounted tools.

#![deny(unsafe_code)]

mod console;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use vsm_core::InvokePolicy;
use vsm_mcp::{mount_mcp_server, ClientOptions, McpServer};
use vsm_runtime::{CapsuleBuilder, Port, Runtime, SessionOrchestrator, StaticPrompt};
use vsm_settings::VsmSettings;
use vsm_telemetry::{init_telemetry, Monitoring, TelemetryConfig, TelemetryGuard, TracingSink};

use crate::console::ConsolePort;
use crate::tools::{ClockTool, EchoTool};

/// Message-bus runtime for tool-calling LLM sessions.
#[derive(Parser, Debug)]
#[command(name = "vsm", version, about)]
struct Cli {
    /// Settings file (defaults to ~/.vsm/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one turn against the configured provider and stream the answer.
    Ask {
        /// The user message.
        prompt: String,
    },
    /// Expose built-in and mounted tools over the stdio RPC server.
    ServeMcp,
}

fn load(cli: &Cli) -> Result<VsmSettings> {
    match &cli.config {
        Some(path) => vsm_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => vsm_settings::load_settings().context("failed to load settings"),
    }
}

/// Built-in tools, monitoring and every configured remote server.
async fn base_builder(settings: &VsmSettings, telemetry: &TelemetryGuard) -> Result<CapsuleBuilder> {
    let monitoring = Monitoring::new(Arc::new(TracingSink)).with_metrics(telemetry.metrics());
    let mut builder = CapsuleBuilder::new("vsm")
        .with_settings(settings)
        .metrics(telemetry.metrics())
        .monitoring(Arc::new(monitoring))
        .tool(Arc::new(EchoTool))
        .tool(Arc::new(ClockTool));

    let options = ClientOptions::from_settings(&settings.mcp);
    for server in &settings.mcp.servers {
        builder = mount_mcp_server(builder, server, options.clone())
            .await
            .with_context(|| format!("failed to mount tool server '{}'", server.name))?;
    }
    Ok(builder)
}

async fn ask(settings: &VsmSettings, telemetry: &TelemetryGuard, prompt: String) -> Result<()> {
    let provider = vsm_llm::build_adapter(&settings.provider).context("failed to build provider")?;
    info!(provider = provider.name(), model = provider.model(), "provider ready");

    let policy = InvokePolicy {
        max_tokens: settings.provider.max_tokens,
        ..InvokePolicy::default()
    };
    let orchestrator = SessionOrchestrator::new(provider)
        .with_hooks(Arc::new(StaticPrompt(settings.provider.system_prompt.clone())))
        .with_policy(policy);

    let capsule = base_builder(settings, telemetry)
        .await?
        .intelligence(Arc::new(orchestrator))
        .build();
    let port: Arc<dyn Port> = Arc::new(ConsolePort::new(prompt));
    Runtime::start(capsule, vec![port]).join().await?;
    Ok(())
}

async fn serve_mcp(settings: &VsmSettings, telemetry: &TelemetryGuard) -> Result<()> {
    let capsule = base_builder(settings, telemetry).await?.build();
    info!(tools = ?capsule.tool_names(), "serving tools over stdio");
    let server: Arc<dyn Port> =
        Arc::new(McpServer::stdio(settings.mcp.framing).with_debug(settings.mcp.debug));
    Runtime::start(capsule, vec![server]).join().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let logging = &settings.logging;
    let telemetry = init_telemetry(TelemetryConfig::from_levels(
        &logging.level,
        logging.module_levels.iter().map(|(m, l)| (m.as_str(), l.as_str())),
        logging.json,
    ));

    let outcome = match cli.command {
        Command::Ask { prompt } => ask(&settings, &telemetry, prompt).await,
        Command::ServeMcp => serve_mcp(&settings, &telemetry).await,
    };
    if let Err(e) = &outcome {
        warn!(error = %e, "vsm exited with an error");
    }
    outcome
}
