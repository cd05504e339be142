use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::{error, info};

use guard_node::admin;
use guard_node::config::GuardConfig;
use guard_node::proxy::AppState;
use guard_node::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guard_node=info".into()),
        )
        .with_target(false)
        .with_line_number(true)
        .init();

    info!(
        "Starting guard-node v{} - DDoS detection and mitigation proxy",
        env!("CARGO_PKG_VERSION")
    );

    let config = match GuardConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration rejected");
            return Err(err.into());
        }
    };

    info!(
        upstream = %config.upstream_base_url,
        sensitivity = %config.sensitivity_level,
        window_seconds = config.sliding_window_seconds,
        request_rate_limit = config.request_rate_limit,
        honor_x_forwarded_for = config.honor_x_forwarded_for,
        "configuration loaded"
    );

    let metrics_handle =
        telemetry::install_metrics_recorder().context("failed to install metrics recorder")?;

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("listen_addr rejected after validation")?;

    let state = AppState::from_config(config, Some(metrics_handle))?;
    state.spawn_background_tasks();

    let app = admin::router(state.clone());
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listen address")?;
    info!(listen_addr = %listen_addr, "guard node serving");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    state.upstream.close().await;
    info!("guard node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received, draining");
}
