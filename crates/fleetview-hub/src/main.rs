mod api;
mod config;
mod logging;
mod upstream;

use anyhow::{bail, Context, Result};
use fleetview_core::{EventRouter, FleetRuntime};
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    let log_guard = logging::init_logging(&config);
    let log_file = log_guard
        .as_ref()
        .and_then(|guard| guard.path())
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return Err(err).with_context(|| format!("invalid listen address '{}'", config.addr));
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        bail!("listen address must be loopback, got {addr}");
    }

    let router = EventRouter::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.sync.queue_capacity);
    let (fleet, runtime_task) = FleetRuntime::spawn(config.sync, router.clone(), outbound_tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let upstream_task = tokio::spawn(upstream::run(
        upstream::UpstreamConfig {
            url: config.fleet_url.clone(),
            reconnect_max: config.reconnect_max,
            max_frame_bytes: config.max_frame_bytes,
        },
        fleet.clone(),
        router,
        outbound_rx,
        shutdown_rx.clone(),
    ));

    let app = api::router(api::ApiState::new(fleet.clone(), config.slots, shutdown_rx));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    info!(
        event = "hub_start",
        session_id = %config.session_id,
        addr = %config.addr,
        fleet_host = config.fleet_url.host_str().unwrap_or(""),
        grace_ms = config.sync.grace_window.as_millis() as u64,
        log_file = %log_file
    );

    let signal = shutdown_tx.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown", reason = "signal");
        let _ = signal.send(true);
    };

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    if let Err(err) = &served {
        error!(event = "hub_error", error = %err);
    }

    let _ = shutdown_tx.send(true);
    let _ = upstream_task.await;
    fleet.teardown().await;
    let _ = runtime_task.await;
    info!(event = "hub_stop", session_id = %config.session_id);
    served.context("serve presentation api")
}
