//! Owns the WebSocket connection to a coordinator: connect, keepalive
//! ping/pong, exponential-backoff reconnect, and re-registration on
//! reconnect (`spec.md` §4.2).
//!
//! Grounded on the connect/split/read-write-task shape used by signaling
//! servers in the retrieved corpus and the seed-node retry/backoff
//! pattern in this workspace's DHT bootstrap code, adapted to the
//! client side of a single persistent connection rather than a fan-out
//! to many peers.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::messages::{ClientMessage, ServerMessage};
use crate::{ConnectionState, SignalingError, KEEPALIVE_INTERVAL, KEEPALIVE_MISSED_INTERVALS};

/// A handle to a running signaling client. Cloning shares the same
/// underlying connection; dropping every handle and the event receiver
/// shuts the connection down.
#[derive(Clone)]
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SignalingHandle {
    /// Queue a message for sending. Messages sent while disconnected are
    /// buffered and flushed once the connection is re-established,
    /// except `register`/`register_rendezvous`, which the client
    /// re-issues itself from cached state on every reconnect (`spec.md`
    /// §4.2 "Reconnection").
    pub fn send(&self, message: ClientMessage) -> crate::Result<()> {
        self.outbound.send(message).map_err(|_| SignalingError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_rx(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// Cached registration state, replayed after every reconnect (`spec.md`
/// §4.2: "on reconnect, re-register and re-announce rendezvous state").
#[derive(Clone, Debug, Default)]
struct ReplayState {
    register: Option<ClientMessage>,
    register_rendezvous: Option<ClientMessage>,
}

impl ReplayState {
    fn observe(&mut self, message: &ClientMessage) {
        match message {
            ClientMessage::Register { .. } => self.register = Some(message.clone()),
            ClientMessage::RegisterRendezvous { .. } => self.register_rendezvous = Some(message.clone()),
            _ => {}
        }
    }

    fn replay(&self) -> Vec<ClientMessage> {
        [self.register.clone(), self.register_rendezvous.clone()].into_iter().flatten().collect()
    }
}

/// Connect to `url` and spawn the background task that owns the socket.
/// Returns a handle for sending outbound messages and watching
/// connection state, plus a channel of parsed inbound [`ServerMessage`]s.
pub fn connect(url: impl Into<String>) -> (SignalingHandle, mpsc::UnboundedReceiver<ServerMessage>) {
    let url = url.into();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    tokio::spawn(run(url, outbound_rx, outbound_tx.clone(), inbound_tx, state_tx));

    (SignalingHandle { outbound: outbound_tx, state_rx }, inbound_rx)
}

async fn run(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    inbound_tx: mpsc::UnboundedSender<ServerMessage>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut replay = ReplayState::default();
    let mut attempt: u32 = 0;

    loop {
        let _ = state_tx.send(ConnectionState::Connecting);
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _response)) => {
                info!(%url, "signaling connected");
                attempt = 0;
                let _ = state_tx.send(ConnectionState::Connected);

                for message in replay.replay() {
                    let _ = outbound_tx.send(message);
                }

                let reason = drive_connection(stream, &mut outbound_rx, &outbound_tx, &inbound_tx, &mut replay).await;
                warn!(%url, ?reason, "signaling connection ended");
            }
            Err(e) => {
                warn!(%url, error = %e, "signaling connect failed");
            }
        }

        let _ = state_tx.send(ConnectionState::Failed);
        if outbound_rx.is_closed() && inbound_tx.is_closed() {
            debug!("signaling client handles dropped, stopping reconnect loop");
            return;
        }

        let delay = crate::backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

enum DisconnectReason {
    PeerClosed,
    KeepaliveTimeout,
    OversizeFrame,
    HandleDropped,
    Io(String),
}

impl std::fmt::Debug for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::KeepaliveTimeout => write!(f, "keepalive timeout"),
            Self::OversizeFrame => write!(f, "oversize frame"),
            Self::HandleDropped => write!(f, "handle dropped"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

async fn drive_connection(
    stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    outbound_tx: &mpsc::UnboundedSender<ClientMessage>,
    inbound_tx: &mpsc::UnboundedSender<ServerMessage>,
    replay: &mut ReplayState,
) -> DisconnectReason {
    let (mut write, mut read) = stream.split();
    let mut missed_intervals: u32 = 0;
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        replay.observe(&message);
                        let frame = match message.to_frame() {
                            Ok(f) => f,
                            Err(SignalingError::FrameTooLarge { .. }) => {
                                warn!("dropping outbound frame exceeding size ceiling");
                                continue;
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to serialize outbound message");
                                continue;
                            }
                        };
                        if write.send(WsMessage::Text(frame)).await.is_err() {
                            return DisconnectReason::Io("write failed".to_string());
                        }
                    }
                    None => return DisconnectReason::HandleDropped,
                }
            }

            _ = keepalive.tick() => {
                missed_intervals += 1;
                if missed_intervals >= KEEPALIVE_MISSED_INTERVALS {
                    return DisconnectReason::KeepaliveTimeout;
                }
                let ping = ClientMessage::Ping;
                if let Ok(frame) = ping.to_frame() {
                    if write.send(WsMessage::Text(frame)).await.is_err() {
                        return DisconnectReason::Io("ping write failed".to_string());
                    }
                }
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        missed_intervals = 0;
                        if text.len() > crate::MAX_FRAME_SIZE {
                            return DisconnectReason::OversizeFrame;
                        }
                        match ServerMessage::from_frame(&text) {
                            Ok(parsed) => {
                                if inbound_tx.send(parsed).is_err() {
                                    return DisconnectReason::HandleDropped;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "discarding malformed signaling message");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                        missed_intervals = 0;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return DisconnectReason::PeerClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return DisconnectReason::Io(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_state_keeps_latest_register_and_rendezvous() {
        let mut replay = ReplayState::default();
        assert!(replay.replay().is_empty());

        replay.observe(&ClientMessage::Register {
            pairing_code: "AB23CD".to_string(),
            public_key: crate::messages::WireKey::encode(&[1u8; 32]),
            capacity: None,
        });
        assert_eq!(replay.replay().len(), 1);

        replay.observe(&ClientMessage::RegisterRendezvous {
            daily: vec!["p1".to_string()],
            hourly: vec!["h1".to_string()],
            dead_drop: None,
        });
        assert_eq!(replay.replay().len(), 2);

        replay.observe(&ClientMessage::Ping);
        assert_eq!(replay.replay().len(), 2, "non-registration messages are not cached");
    }

    #[test]
    fn replay_state_overwrites_on_re_register() {
        let mut replay = ReplayState::default();
        replay.observe(&ClientMessage::Register {
            pairing_code: "AAAAAA".to_string(),
            public_key: crate::messages::WireKey::encode(&[1u8; 32]),
            capacity: None,
        });
        replay.observe(&ClientMessage::Register {
            pairing_code: "BBBBBB".to_string(),
            public_key: crate::messages::WireKey::encode(&[2u8; 32]),
            capacity: None,
        });
        let replayed = replay.replay();
        assert_eq!(replayed.len(), 1);
        match &replayed[0] {
            ClientMessage::Register { pairing_code, .. } => assert_eq!(pairing_code, "BBBBBB"),
            _ => panic!("expected register"),
        }
    }
}
