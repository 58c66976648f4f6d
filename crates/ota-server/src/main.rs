mod config;
mod routes;

use tokio::net::TcpListener;
use tracing::{info, warn};

use ota_gateway::Gateway;

use crate::config::Config;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ota_server=debug,ota_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Devices connect back to these after accepting an invitation
    let firmware = TcpListener::bind(config.firmware_addr()).await?;
    let spiffs = TcpListener::bind(config.spiffs_addr()).await?;
    let gateway = Gateway::start(config.gateway(), firmware, spiffs)?;

    match config.public_ip {
        Some(ip) => info!("Invitations sent from {} to device port {}", ip, config.device_port),
        None => info!("Invitations sent to device port {}", config.device_port),
    }

    let app = routes::router(AppState { gateway }, config.max_upload_bytes);

    let addr = config.http_addr();
    info!("OTA gateway listening on {}", addr);
    info!("Max upload: {} MB", config.max_upload_bytes / (1024 * 1024));

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
