use std::sync::Arc;

use tracing::info;

use slotgate::config::EngineConfig;
use slotgate::engine::Engine;
use slotgate::notify::NotifyHub;
use slotgate::outbound::Collaborators;
use slotgate::reaper;

async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = ctrl_c => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::from_env()?;
    slotgate::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::with_options(
        config.wal_path(),
        Arc::new(NotifyHub::new()),
        Collaborators::default(),
        config.engine_options(),
    )?);

    info!("slotgate started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  hosts: {}", engine.list_hosts().await.len());
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!("  retention: {} days", config.retention.as_secs() / 86_400);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let completer = tokio::spawn(reaper::run_completer(
        engine.clone(),
        config.sweep_interval,
        config.retention,
    ));
    let compactor = tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    shutdown_signal().await?;
    info!("shutdown signal received, stopping background jobs");
    completer.abort();
    compactor.abort();

    // Leave a compact journal behind for the next start.
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("slotgate stopped");
    Ok(())
}
