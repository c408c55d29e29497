//! CARISMA daemon entry point.

use std::time::Duration;

use clap::Parser;
use log::{error, info, LevelFilter};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use carisma::config::{Args, Config};
use carisma::{agent, control_plane};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Config::load(&args)?;

    // Initialize logging; RUST_LOG still wins over the debug flag
    env_logger::Builder::new()
        .filter_level(if cfg.enable_debug_mode {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    info!("Starting CARISMA orchestrator 🚀");

    let (tx_shutdown, rx_shutdown) = watch::channel(());

    // Control plane (central mode only)
    let control_plane_handle = if cfg.enable_central_mode {
        let cp_cfg = cfg.clone();
        let mut shutdown = rx_shutdown.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown.changed().await;
            };
            if let Err(e) = control_plane::run(cp_cfg, shutdown).await {
                error!("Control plane failed: {:#}", e);
            }
        }))
    } else {
        None
    };

    // Per-node agent
    let agent_cfg = cfg.clone();
    let mut agent_handle = tokio::spawn(async move {
        if let Err(e) = agent::run(agent_cfg).await {
            error!("Agent failed: {:#}", e);
        }
    });

    // Graceful shutdown on SIGINT/SIGTERM
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        _ = &mut agent_handle => info!("Agent finished, shutting down..."),
    }

    // Stopping the transport ends every open stream, which triggers the
    // "stopped" actual-state emissions for connected nodes
    let _ = tx_shutdown.send(());
    drop(rx_shutdown);

    agent_handle.abort();
    if let Some(handle) = control_plane_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    agent::shutdown_cleanup(&cfg).await;

    info!("Shutdown complete.");
    Ok(())
}
