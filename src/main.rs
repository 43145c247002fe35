use anyhow::Context;
use tokio::signal;
use tracing::{error, info};
use vigil::{Config, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("vigil=info".parse()?),
        )
        .init();

    info!("Vigil v{} starting", vigil::VERSION);

    let Some(config_path) = std::env::args().nth(1) else {
        error!("Usage: vigil <config.yaml>");
        std::process::exit(1);
    };

    let config = Config::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    info!(
        "Loaded {} tags, {} supervised entities, {} alarms",
        config.entities.tags.len(),
        config.entities.supervised.len(),
        config.entities.alarms.len()
    );

    let engine = Engine::new(config.clone()).context("failed to build engine")?;
    engine.seed(&config.entities).context("failed to seed entities")?;
    engine.start().context("failed to start engine")?;

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    engine.shutdown().await;

    let stats = engine.stats();
    info!(
        "Final stats: {} tags, {} alarms ({} active), {} entries persisted, uptime: {}s",
        stats.tag_count, stats.alarm_count, stats.active_alarms, stats.persisted, stats.uptime_secs
    );

    Ok(())
}
