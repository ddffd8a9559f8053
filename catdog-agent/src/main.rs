/**
 * CATDOG AGENT - Point d'entrée du superviseur d'un device
 *
 * RÔLE : Charge le roster YAML, lance les modules, les surveille jusqu'à
 * Ctrl-C / SIGTERM puis les arrête proprement.
 */

use std::path::PathBuf;

use anyhow::{Context, Result};
use catdog_agent::signals::{init_tracing, shutdown_signal};
use catdog_agent::{Agent, AgentConfig, CONFIG_ENV, DEFAULT_CONFIG_PATH};
use clap::Parser;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "catdog-agent", version, about = "Supervise the catdog modules of this device")]
struct Cli {
    /// Roster YAML
    #[arg(long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Host the global channel in this process
    #[arg(long)]
    primary: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = AgentConfig::load(&cli.config)
        .await
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let mut agent = Agent::new(config)
        .context("invalid agent configuration")?
        .primary(cli.primary);

    agent.start().await.context("agent startup failed")?;
    info!(relay = ?agent.relay_addr(), "agent running, waiting for shutdown signal");

    shutdown_signal().await;
    info!("shutdown signal received");
    agent.stop().await;
    Ok(())
}
