//! zapgate - streaming gateway between IPTV clients and a zap-style
//! upstream receiver.

use tracing::{error, info};

use zapgate::config::GatewayConfig;
use zapgate::logging::init_logging;
use zapgate::server::{AppState, ProxyServer};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let _guard = init_logging(&log_dir)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    info!("starting zapgate v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::from_env_or_default();
    let state = AppState::build(config).await?;
    let server = ProxyServer::new(state);

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = wait_for_sigterm() => {
                info!("received SIGTERM, shutting down");
            }
        }
        cancel.cancel();
    });

    if let Err(e) = server.run().await {
        error!(error = %e, "gateway exited with error");
        return Err(e.into());
    }

    info!("zapgate shutdown complete");
    Ok(())
}

/// Wait for SIGTERM (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
