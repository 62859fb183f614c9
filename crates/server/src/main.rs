use std::time::Duration;

use anyhow::Result;
use negocia_core::config::{AppConfig, LoadOptions, LogFormat};
use negocia_server::{bootstrap, health, sweeper};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        LogFormat::Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // logging needs the configured level, so config comes first
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap(config)?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.runtime.clone(),
    )
    .await?;

    let sweeper = sweeper::spawn(
        app.runtime.clone(),
        Duration::from_secs(app.config.negotiation.eviction_interval_secs),
        app.config.negotiation.idle_max_age_hours,
    );

    app.ingress.start().await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        "negocia-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        active_contexts = app.runtime.active_contexts(),
        active_workers = app.ingress.active_workers(),
        "negocia-server stopping"
    );

    sweeper.abort();
    app.ingress.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
