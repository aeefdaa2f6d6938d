use chrono::Utc;
use fleetview_core::{
    decode_frame, encode_frame, EventFrame, EventRouter, FleetHandle, LinkState, OutboundCommand,
    RouteOutcome,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub url: Url,
    pub reconnect_max: Duration,
    pub max_frame_bytes: usize,
}

enum SessionEnd {
    Shutdown,
    Dropped,
    OutboundClosed,
}

/// Keeps a link to the fleet server up until shutdown, reporting every
/// transition to the runtime.
pub async fn run(
    config: UpstreamConfig,
    fleet: FleetHandle,
    router: EventRouter,
    mut outbound: mpsc::Receiver<OutboundCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            break;
        }
        if fleet.link(LinkState::Connecting).await.is_err() {
            break;
        }

        let connect = tokio::select! {
            connect = connect_async(config.url.as_str()) => connect,
            _ = shutdown.changed() => break,
        };
        let (ws, _) = match connect {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "upstream_connect_error", error = %err, retry_ms = backoff.as_millis() as u64);
                if fleet.link(LinkState::Disconnected).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = next_backoff(backoff, config.reconnect_max);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;

        if fleet.link(LinkState::Connected).await.is_err() {
            break;
        }
        info!(event = "upstream_connected", host = config.url.host_str().unwrap_or(""));

        let end = session(&config, ws, &router, &mut outbound, &mut shutdown).await;
        let dropped = drain(&mut outbound);
        if dropped > 0 {
            warn!(event = "command_queue_drop", reason = "link_lost", dropped);
        }
        let _ = fleet.link(LinkState::Disconnected).await;
        match end {
            SessionEnd::Shutdown | SessionEnd::OutboundClosed => break,
            SessionEnd::Dropped => {
                warn!(event = "upstream_disconnected", retry_ms = backoff.as_millis() as u64);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    info!(event = "upstream_stop");
}

type FleetSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn session(
    config: &UpstreamConfig,
    mut ws: FleetSocket,
    router: &EventRouter,
    outbound: &mut mpsc::Receiver<OutboundCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let end = loop {
        tokio::select! {
            _ = shutdown.changed() => break SessionEnd::Shutdown,
            msg = ws.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(event = "frame_rejected", reason = "invalid_utf8");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break SessionEnd::Dropped,
                    Some(Ok(_)) => continue,
                };
                match decode_frame(&text, config.max_frame_bytes) {
                    Ok(frame) => {
                        let kind = frame.event.clone();
                        if let RouteOutcome::Closed = router.route(frame.into_raw(Utc::now())).await {
                            debug!(event = "route_drop", kind = %kind, reason = "queue_closed");
                        }
                    }
                    Err(err) => warn!(event = "frame_rejected", error = %err),
                }
            }
            command = outbound.recv() => {
                let Some(command) = command else {
                    break SessionEnd::OutboundClosed;
                };
                let encoded = match encode_frame(&EventFrame::from(&command), config.max_frame_bytes) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        warn!(event = "command_encode_error", error = %err);
                        continue;
                    }
                };
                if ws.send(Message::Text(encoded)).await.is_err() {
                    warn!(event = "command_send_error", command = command.kind(), agent_id = %command.agent_id());
                    break SessionEnd::Dropped;
                }
                info!(event = "command_forwarded", command = command.kind(), agent_id = %command.agent_id());
            }
        }
    };
    let _ = ws.close(None).await;
    end
}

fn drain(outbound: &mut mpsc::Receiver<OutboundCommand>) -> usize {
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}
