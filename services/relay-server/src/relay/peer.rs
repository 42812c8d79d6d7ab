use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rover_protocol::{RelayPayload, PONG};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::hub::RelayHub;

/// Drive one relay peer until it closes or fails its liveness probe.
///
/// Every `probe_every` the peer is sent a WebSocket ping. If no pong arrived
/// since the previous ping, the connection is closed and the peer removed.
pub async fn serve_peer(socket: WebSocket, hub: Arc<RelayHub>, probe_every: Duration) {
    let (id, mut outbound) = hub.join();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut probe = interval_at(Instant::now() + probe_every, probe_every);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut alive = true;

    loop {
        tokio::select! {
            _ = probe.tick() => {
                if !alive {
                    warn!(peer = id, "relay peer missed liveness probe, closing");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                alive = false;
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            Some(cmd) = outbound.recv() => {
                if ws_tx.send(Message::Text(cmd.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => alive = true,
                    Some(Ok(Message::Text(text))) => match RelayPayload::classify(text.as_str()) {
                        RelayPayload::Ping => {
                            if ws_tx.send(Message::Text(PONG.into())).await.is_err() {
                                break;
                            }
                        }
                        RelayPayload::Pong => {}
                        RelayPayload::Command(cmd) => {
                            let delivered = hub.relay(id, cmd);
                            debug!(peer = id, command = %cmd, delivered, "relayed command");
                        }
                        RelayPayload::Empty | RelayPayload::Unrecognized => {
                            debug!(peer = id, "dropping unrecognized relay payload");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer = id, error = %e, "relay peer read failed");
                        break;
                    }
                    Some(Ok(_)) => {} // Binary and pings are not part of the relay protocol
                }
            }
        }
    }

    hub.leave(id);
}
