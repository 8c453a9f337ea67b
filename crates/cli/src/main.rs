//! Flow definition checker
//!
//! Loads settings the same way a deployment does, validates the configured
//! flow (or one given on the command line) and prints every path from the
//! entry group to the terminal stage.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use dialogue_agent::StageFlow;
use dialogue_config::{load_settings, FlowDefinition, Settings};

#[derive(Debug, Parser)]
#[command(name = "flowcheck")]
#[command(about = "Validate a dialogue flow definition and list its paths", long_about = None)]
#[command(version)]
struct Args {
    /// Settings environment overlay (config/<env>.yaml)
    #[arg(long, env = "DIALOGUE_ENV")]
    env: Option<String>,

    /// Flow file to check instead of the configured one
    flow: Option<PathBuf>,
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &settings.observability.log_level;
        format!("dialogue={},flowcheck={}", level, level).into()
    });

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(args.env.as_deref()).context("failed to load settings")?;
    init_tracing(&settings);

    let definition = match &args.flow {
        Some(path) => FlowDefinition::from_file(path),
        None => settings.load_flow(),
    }
    .context("failed to load flow definition")?;

    tracing::info!(
        flow = %definition.name,
        stages = definition.stages.len(),
        groups = definition.groups.len(),
        "Loaded flow definition"
    );

    let flow = StageFlow::build(definition).context("flow definition is invalid")?;

    println!("flow '{}' is valid", flow.name());
    println!("terminal stage: {}", flow.terminal());
    for (i, path) in flow.paths().iter().enumerate() {
        println!("  path {}: {}", i + 1, path);
    }
    Ok(())
}
