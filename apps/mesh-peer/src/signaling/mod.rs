use futures_util::{SinkExt, StreamExt};
use mesh_protocol::{ProtocolError, SignalingEnvelope};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use url::Url;

pub mod local;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What the channel hands to the session manager.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Envelope(SignalingEnvelope),
    /// Delivered exactly once, after which nothing else arrives.
    Closed { reason: String },
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Envelope(SignalingEnvelope),
    Ping,
    Close,
}

/// Cloneable handle used by the manager and every peer task to emit
/// envelopes. Sending gives no delivery confirmation.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl SignalingSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                open: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    /// A sender that is not attached to any relay. Everything sent through it
    /// lands in the returned outbox.
    pub fn detached() -> (Self, Outbox) {
        let (sender, rx) = Self::channel();
        (sender, Outbox { rx })
    }

    pub fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::ChannelClosed);
        }
        self.tx
            .send(Outbound::Envelope(envelope))
            .map_err(|_| SignalingError::ChannelClosed)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Ask the relay connection to shut down. The inbound side reports
    /// `ChannelEvent::Closed` once the close has gone through.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub(crate) fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping).is_ok()
    }

    pub(crate) fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::SeqCst)
    }
}

/// Receiving end of a detached sender.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Outbox {
    pub async fn recv(&mut self) -> Option<SignalingEnvelope> {
        while let Some(outbound) = self.rx.recv().await {
            if let Outbound::Envelope(envelope) = outbound {
                return Some(envelope);
            }
        }
        None
    }

    /// Everything sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<SignalingEnvelope> {
        let mut envelopes = Vec::new();
        while let Ok(outbound) = self.rx.try_recv() {
            if let Outbound::Envelope(envelope) = outbound {
                envelopes.push(envelope);
            }
        }
        envelopes
    }
}

#[derive(Debug)]
struct ChannelState {
    sender: SignalingSender,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelState {
    fn mark_closed(&self, reason: impl Into<String>) {
        if self.sender.mark_closed() {
            let reason = reason.into();
            tracing::info!(target = "mesh", reason = %reason, "signaling channel closed");
            let _ = self.events.send(ChannelEvent::Closed { reason });
        }
    }
}

/// WebSocket connection to the relay. Dropping it stops the background
/// tasks without reporting a close.
pub struct SignalingConnection {
    url: Url,
    sender: SignalingSender,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingConnection {
    pub async fn connect(relay_url: &str, heartbeat: Duration) -> Result<Self, SignalingError> {
        let url = normalize_relay_url(relay_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(target = "mesh", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (sender, mut outbound_rx) = SignalingSender::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ChannelState {
            sender: sender.clone(),
            events: events_tx,
        });

        let writer_state = Arc::clone(&state);
        let writer = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                let message = match outbound {
                    Outbound::Envelope(envelope) => match envelope.encode() {
                        Ok(text) => {
                            tracing::trace!(
                                target = "mesh",
                                event = "ws_out",
                                kind = %envelope.kind(),
                                len = text.len()
                            );
                            Message::Text(text)
                        }
                        Err(err) => {
                            tracing::warn!(
                                target = "mesh",
                                kind = %envelope.kind(),
                                error = %err,
                                "failed to encode envelope"
                            );
                            continue;
                        }
                    },
                    Outbound::Ping => Message::Ping(Vec::new()),
                    Outbound::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        writer_state.mark_closed("closed locally");
                        break;
                    }
                };
                if let Err(err) = ws_write.send(message).await {
                    writer_state.mark_closed(format!("relay write failed: {err}"));
                    break;
                }
            }
        });

        let reader_state = Arc::clone(&state);
        let reader = tokio::spawn(async move {
            let mut reason = String::from("relay closed the connection");
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => deliver(&reader_state, &text),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => deliver(&reader_state, &text),
                        Err(_) => {
                            tracing::warn!(target = "mesh", "dropping non-utf8 binary frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "mesh", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "mesh", "signaling websocket error: {err}");
                            }
                        }
                        reason = err.to_string();
                        break;
                    }
                }
            }
            reader_state.mark_closed(reason);
        });

        let mut tasks = vec![writer, reader];
        if !heartbeat.is_zero() {
            let heartbeat_sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(heartbeat);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !heartbeat_sender.is_open() || !heartbeat_sender.ping() {
                        break;
                    }
                }
            }));
        }

        Ok(Self {
            url,
            sender,
            events: Some(events_rx),
            tasks,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    /// The inbound event stream. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

fn deliver(state: &ChannelState, text: &str) {
    tracing::trace!(target = "mesh", event = "ws_in", len = text.len());
    match SignalingEnvelope::decode(text) {
        Ok(envelope) => {
            let _ = state.events.send(ChannelEvent::Envelope(envelope));
        }
        Err(err) => {
            tracing::warn!(target = "mesh", error = %err, "dropping malformed envelope");
        }
    }
}

/// Accepts ws/wss relay urls and maps http/https onto them.
pub fn normalize_relay_url(relay_url: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: relay_url.to_string(),
        reason,
    };
    let mut url = Url::parse(relay_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to a websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_protocol::ParticipantId;

    #[test]
    fn relay_urls_are_normalized_to_websocket_schemes() {
        assert_eq!(
            normalize_relay_url("http://127.0.0.1:8084").unwrap().as_str(),
            "ws://127.0.0.1:8084/"
        );
        assert_eq!(
            normalize_relay_url("https://relay.example.com/mesh#x")
                .unwrap()
                .as_str(),
            "wss://relay.example.com/mesh"
        );
        assert_eq!(
            normalize_relay_url("ws://127.0.0.1:8084").unwrap().scheme(),
            "ws"
        );
    }

    #[test]
    fn rejects_unusable_relay_urls() {
        assert!(matches!(
            normalize_relay_url("ftp://relay.example.com"),
            Err(SignalingError::InvalidUrl { .. })
        ));
        assert!(matches!(
            normalize_relay_url("not a url"),
            Err(SignalingError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn closed_sender_refuses_envelopes() {
        let (sender, mut outbox) = SignalingSender::detached();
        let envelope = SignalingEnvelope::PeerLeft {
            peer: ParticipantId::new("b"),
        };
        sender.send(envelope.clone()).unwrap();
        assert!(sender.mark_closed());
        assert!(!sender.mark_closed());
        assert!(matches!(
            sender.send(envelope.clone()),
            Err(SignalingError::ChannelClosed)
        ));
        assert_eq!(outbox.drain(), vec![envelope]);
    }

    #[test]
    fn outbox_skips_control_messages() {
        let (sender, mut outbox) = SignalingSender::detached();
        assert!(sender.ping());
        sender.close();
        sender
            .send(SignalingEnvelope::PeerJoined {
                peer: ParticipantId::new("c"),
            })
            .unwrap();
        let sent = outbox.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer().map(|p| p.as_str()), Some("c"));
    }

    #[test]
    fn dropped_receiver_closes_sender() {
        let (sender, outbox) = SignalingSender::detached();
        drop(outbox);
        assert!(!sender.is_open());
        assert!(matches!(
            sender.send(SignalingEnvelope::PeerLeft { peer: "b".into() }),
            Err(SignalingError::ChannelClosed)
        ));
    }
}
