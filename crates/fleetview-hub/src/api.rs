use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleetview_core::{CommandError, FleetHandle, FleetSnapshot, LinkState, SlotView};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ApiState {
    fleet: FleetHandle,
    slots: usize,
    shutdown: watch::Receiver<bool>,
}

impl ApiState {
    pub fn new(fleet: FleetHandle, slots: usize, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            fleet,
            slots,
            shutdown,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    link: LinkState,
    version: u64,
}

#[derive(Debug, Serialize)]
struct SlotsBody {
    version: u64,
    slots: Vec<SlotView>,
}

#[derive(Debug, Serialize)]
struct CommandAccepted {
    status: &'static str,
    command: &'static str,
    agent_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/snapshot", get(snapshot))
        .route("/slots", get(slots))
        .route("/agents/:id/deploy", post(deploy_agent))
        .route("/agents/:id/stop", post(stop_agent))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<HealthBody> {
    let snapshot = state.fleet.snapshot();
    Json(HealthBody {
        status: "ok",
        link: snapshot.link,
        version: snapshot.version,
    })
}

async fn snapshot(State(state): State<ApiState>) -> Json<Arc<FleetSnapshot>> {
    Json(state.fleet.snapshot())
}

async fn slots(State(state): State<ApiState>) -> Json<SlotsBody> {
    let snapshot = state.fleet.snapshot();
    Json(SlotsBody {
        version: snapshot.version,
        slots: snapshot.slots(state.slots),
    })
}

async fn deploy_agent(State(state): State<ApiState>, Path(agent_id): Path<String>) -> Response {
    command_response("deploy", &agent_id, state.fleet.deploy(&agent_id).await)
}

async fn stop_agent(State(state): State<ApiState>, Path(agent_id): Path<String>) -> Response {
    command_response("stop", &agent_id, state.fleet.stop(&agent_id).await)
}

fn command_response(
    command: &'static str,
    agent_id: &str,
    result: Result<(), CommandError>,
) -> Response {
    match result {
        Ok(()) => {
            info!(event = "command_accepted", command, agent_id);
            (
                StatusCode::ACCEPTED,
                Json(CommandAccepted {
                    status: "accepted",
                    command,
                    agent_id: agent_id.to_string(),
                }),
            )
                .into_response()
        }
        Err(err) => {
            warn!(event = "command_rejected", command, agent_id, code = err.code(), error = %err);
            (
                command_status(&err),
                Json(ErrorBody {
                    error: err.code(),
                    message: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

fn command_status(err: &CommandError) -> StatusCode {
    match err {
        CommandError::UnknownAgent(_) => StatusCode::NOT_FOUND,
        CommandError::NotConnected
        | CommandError::QueueFull
        | CommandError::ChannelClosed
        | CommandError::TornDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        stream_snapshots(socket, state, addr).await;
    })
}

/// Pushes the current snapshot, then every newer one, until either side goes away.
async fn stream_snapshots(mut socket: WebSocket, state: ApiState, remote: SocketAddr) {
    let mut snapshots = state.fleet.subscribe_snapshots();
    let mut shutdown = state.shutdown.clone();
    debug!(event = "viewer_connected", remote = %remote);

    let first = snapshots.borrow_and_update().clone();
    if !send_snapshot(&mut socket, &first).await {
        return;
    }
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if !send_snapshot(&mut socket, &snapshot).await {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    let _ = socket.send(Message::Close(None)).await;
    debug!(event = "viewer_disconnected", remote = %remote);
}

async fn send_snapshot(socket: &mut WebSocket, snapshot: &Arc<FleetSnapshot>) -> bool {
    let text = match serde_json::to_string(snapshot.as_ref()) {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "snapshot_encode_error", error = %err);
            return false;
        }
    };
    socket.send(Message::Text(text)).await.is_ok()
}
