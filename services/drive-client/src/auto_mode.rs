//! Autonomous mode: a relay channel whose commands are fed to the queue.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rover_protocol::{Command, RelayPayload, PING};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoEvent {
    Opened,
    Payload(String),
    /// Channel closed or failed; the reason is set on failure.
    Closed(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoAction {
    Forward(Command),
    Ignore,
    /// The channel is gone and auto mode has shut itself off.
    Closed,
}

/// Owns the relay channel task. Events from a superseded channel are
/// filtered out by session number.
pub struct AutoModeClient {
    session: Option<u64>,
    next_session: u64,
    shutdown: Option<oneshot::Sender<()>>,
    last_received: Option<Command>,
    tx: mpsc::UnboundedSender<(u64, AutoEvent)>,
    rx: mpsc::UnboundedReceiver<(u64, AutoEvent)>,
}

impl Default for AutoModeClient {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session: None,
            next_session: 0,
            shutdown: None,
            last_received: None,
            tx,
            rx,
        }
    }
}

impl AutoModeClient {
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Open a channel to `url`, replacing any open one.
    pub fn activate(&mut self, url: String) {
        self.deactivate();
        self.next_session += 1;
        let session = self.next_session;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.session = Some(session);
        self.shutdown = Some(shutdown_tx);
        info!(url = %url, "auto mode on");
        tokio::spawn(run_channel(url, session, self.tx.clone(), shutdown_rx));
    }

    /// Close the channel and forget the last received command.
    pub fn deactivate(&mut self) {
        // Dropping the sender stops the ping timer and closes the socket.
        self.shutdown = None;
        self.session = None;
        self.last_received = None;
    }

    /// Next event of the current channel. Pends while inactive.
    pub async fn next_event(&mut self) -> AutoEvent {
        loop {
            match self.rx.recv().await {
                Some((session, event)) if Some(session) == self.session => return event,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    }

    pub fn handle(&mut self, event: AutoEvent) -> AutoAction {
        match event {
            AutoEvent::Opened => {
                info!("relay channel established");
                AutoAction::Ignore
            }
            AutoEvent::Payload(text) => match RelayPayload::classify(&text) {
                RelayPayload::Pong => {
                    debug!("relay keep-alive");
                    AutoAction::Ignore
                }
                RelayPayload::Command(cmd) => {
                    if self.last_received == Some(cmd) {
                        return AutoAction::Ignore;
                    }
                    self.last_received = Some(cmd);
                    info!(command = %cmd, "relay command");
                    AutoAction::Forward(cmd)
                }
                RelayPayload::Empty | RelayPayload::Ping => AutoAction::Ignore,
                RelayPayload::Unrecognized => {
                    warn!(payload = %text.trim(), "unknown relay command");
                    AutoAction::Ignore
                }
            },
            AutoEvent::Closed(reason) => {
                match reason {
                    Some(e) => warn!(error = %e, "relay channel failed"),
                    None => warn!("relay channel closed"),
                }
                self.deactivate();
                AutoAction::Closed
            }
        }
    }
}

async fn run_channel(
    url: String,
    session: u64,
    tx: mpsc::UnboundedSender<(u64, AutoEvent)>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let emit = |event| {
        let _ = tx.send((session, event));
    };

    let connected = tokio::select! {
        r = tokio_tungstenite::connect_async(url.as_str()) => r,
        _ = &mut shutdown => return,
    };
    let ws = match connected {
        Ok((ws, _)) => ws,
        Err(e) => {
            emit(AutoEvent::Closed(Some(e.to_string())));
            return;
        }
    };
    emit(AutoEvent::Opened);

    let (mut sink, mut stream) = ws.split();
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::text(PING)).await {
                    emit(AutoEvent::Closed(Some(e.to_string())));
                    return;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => emit(AutoEvent::Payload(text.as_str().to_string())),
                Some(Ok(Message::Close(_))) | None => {
                    emit(AutoEvent::Closed(None));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(AutoEvent::Closed(Some(e.to_string())));
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn payload(s: &str) -> AutoEvent {
        AutoEvent::Payload(s.to_string())
    }

    #[test]
    fn test_consecutive_duplicates_dropped() {
        let mut auto = AutoModeClient::default();
        auto.session = Some(1);
        assert_eq!(auto.handle(payload("F")), AutoAction::Forward(Command::Forward));
        assert_eq!(auto.handle(payload("F")), AutoAction::Ignore);
        assert_eq!(auto.handle(payload("pong")), AutoAction::Ignore);
        assert_eq!(auto.handle(payload("F")), AutoAction::Ignore);
        assert_eq!(auto.handle(payload("S")), AutoAction::Forward(Command::Stop));
        assert_eq!(auto.handle(payload("F")), AutoAction::Forward(Command::Forward));
    }

    #[test]
    fn test_unknown_and_empty_dropped() {
        let mut auto = AutoModeClient::default();
        for junk in ["", "  ", "Z", "forward", "ping"] {
            assert_eq!(auto.handle(payload(junk)), AutoAction::Ignore);
        }
        assert_eq!(auto.handle(payload(" L ")), AutoAction::Forward(Command::Left));
    }

    #[test]
    fn test_close_resets_tracking() {
        let mut auto = AutoModeClient::default();
        auto.session = Some(1);
        auto.handle(payload("R"));
        assert_eq!(auto.handle(AutoEvent::Closed(None)), AutoAction::Closed);
        assert!(!auto.is_active());
        assert_eq!(auto.handle(payload("R")), AutoAction::Forward(Command::Right));
    }

    #[tokio::test]
    async fn test_channel_delivers_payloads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for p in ["L", "L", "Z", "R"] {
                ws.send(Message::text(p)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        });

        let mut auto = AutoModeClient::default();
        auto.activate(format!("ws://{addr}/auto-control"));

        let mut actions = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), auto.next_event())
                .await
                .unwrap();
            let action = auto.handle(event);
            actions.push(action);
            if action == AutoAction::Closed {
                break;
            }
        }
        let forwarded: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                AutoAction::Forward(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(forwarded, vec![Command::Left, Command::Right]);
        assert!(!auto.is_active());
    }

    #[tokio::test]
    async fn test_connect_failure_reports_closed() {
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let mut auto = AutoModeClient::default();
        auto.activate(format!("ws://{addr}/auto-control"));
        let event = tokio::time::timeout(Duration::from_secs(5), auto.next_event())
            .await
            .unwrap();
        assert!(matches!(event, AutoEvent::Closed(Some(_))));
    }
}
