use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};

use realtime_voice_engine::clock::TokioClock;
use realtime_voice_engine::config::EngineConfig;
use realtime_voice_engine::engine::Engine;
use realtime_voice_engine::error::Redacted;

/// Demonstration operational surface over the realtime voice engine library.
/// No webview, no audio device I/O — the engine's Non-goals exclude UI
/// rendering and audio encoding, and this CLI honors that boundary.
#[derive(Parser, Debug)]
#[command(name = "engine-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML); falls back to ENGINE_* env vars.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Warm up configuration and smoke-test a credential fetch.
    Init,
    /// Drive one establish/teardown cycle against the configured endpoint
    /// and print the resulting diagnostics snapshot as JSON.
    Diagnose,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_ref()).context("failed to load engine configuration")?;
    config.validate().context("engine configuration failed validation")?;

    let bearer_token = std::env::var("ENGINE_BEARER_TOKEN")
        .context("ENGINE_BEARER_TOKEN must be set to authenticate against the issuance endpoint")?;

    let clock = Arc::new(TokioClock);
    let engine = Engine::new(config, clock).map_err(|e| anyhow!(e.envelope.message.clone()))?;
    engine
        .initialize(Redacted(bearer_token))
        .map_err(|e| anyhow!(e.envelope.message.clone()))?;

    match cli.command {
        Commands::Init => {
            let session_id = engine
                .start_session()
                .await
                .map_err(|e| anyhow!(e.envelope.message.clone()))?;
            println!("credential fetch succeeded; session {} started", session_id.0);
            engine.dispose().await.map_err(|e| anyhow!(e.envelope.message.clone()))?;
        }
        Commands::Diagnose => {
            engine
                .start_session()
                .await
                .map_err(|e| anyhow!(e.envelope.message.clone()))?;
            let diagnostics = engine
                .session_manager()
                .map_err(|e| anyhow!(e.envelope.message.clone()))?
                .get_session_diagnostics();
            engine.dispose().await.map_err(|e| anyhow!(e.envelope.message.clone()))?;
            println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        }
    }

    Ok(())
}
