use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use gateway_core::{init_metrics, init_tracing, mark_ready, clear_ready, set_config_version, shutdown_metrics, start_health_server, BootstrapState};
use inference_gateway::config::{GatewayConfig, SERVICE_NAME};
use inference_gateway::{api, bootstrap};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(SERVICE_NAME)?;
    init_metrics()?;
    let mut boot = BootstrapState::new();

    let cfg = GatewayConfig::load().await?;
    set_config_version(cfg.config_version.clone());
    start_health_server(cfg.health_port).await?;
    boot.advance();

    let store = bootstrap::open_store(&cfg)?;
    boot.advance();

    let builder = bootstrap::register_models(&cfg, store.clone()).await?;
    let state = Arc::new(bootstrap::app_state(&cfg, store, builder));
    boot.advance();

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    mark_ready();
    info!(target: "inference-gateway", ?addr, models = cfg.models.len(), boot_ms = boot.total_elapsed().as_millis() as u64, "serving");

    axum::serve(listener, api::routes(state))
        .with_graceful_shutdown(async { let _ = tokio::signal::ctrl_c().await; })
        .await?;

    clear_ready();
    shutdown_metrics();
    info!(target: "inference-gateway", "shutdown complete");
    Ok(())
}
