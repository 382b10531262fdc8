//! xfrmd - Main Entry Point

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xfrmd::{DaemonConfig, XfrmDaemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("xfrmd v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::var("XFRMD_CONFIG")
        .unwrap_or_else(|_| "/etc/opensase/xfrmd.json".into());

    let config = DaemonConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!(path = %config_path, error = %e, "Config not loaded, using defaults");
        DaemonConfig::default()
    });

    let daemon = XfrmDaemon::new(config)?;
    daemon.init()?;

    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}
