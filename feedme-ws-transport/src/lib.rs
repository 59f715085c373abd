//! A `feedme_client::Transport` over `tokio-tungstenite`, grounded on the
//! forwarder's own uplink WebSocket client: a background task owns the
//! socket, auto-replies to pings, and turns socket-level outcomes into
//! `TransportEvent`s for the client actor to consume.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use feedme_client::{Transport, TransportEvent, TransportFailure, TransportState};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderName;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    pub url: String,
    /// Extra headers applied to the upgrade request, e.g. `Authorization`.
    pub headers: Vec<(String, String)>,
}

impl WsTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// `state` plus a latch on whether a `Disconnect` event has already been
/// sent for the current connection attempt, so the app-initiated
/// `disconnect()` call and `run_connection`'s own socket-level disconnect
/// detection -- which can race each other -- only ever produce one
/// `TransportEvent::Disconnect`.
struct Shared {
    state: TransportState,
    disconnect_sent: bool,
}

pub struct WsTransport {
    config: WsTransportConfig,
    shared: Arc<Mutex<Shared>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    outbound_tx: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: TransportState::Disconnected,
                disconnect_sent: false,
            })),
            events_tx,
            events_rx: Some(events_rx),
            outbound_tx: None,
            task: None,
        }
    }
}

/// Transitions to `Disconnected` and returns whether the caller should be
/// the one to send `TransportEvent::Disconnect` -- true only for whichever
/// side (app-initiated or socket-level) observes the disconnect first.
fn claim_disconnect(shared: &Mutex<Shared>) -> bool {
    let mut shared = shared.lock().unwrap();
    shared.state = TransportState::Disconnected;
    if shared.disconnect_sent {
        false
    } else {
        shared.disconnect_sent = true;
        true
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self) -> Result<(), TransportFailure> {
        let request = build_request(&self.config)?;
        {
            let mut shared = self.shared.lock().unwrap();
            shared.state = TransportState::Connecting;
            shared.disconnect_sent = false;
        }
        let _ = self.events_tx.send(TransportEvent::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound_tx = Some(outbound_tx);
        let events_tx = self.events_tx.clone();
        let shared = self.shared.clone();
        self.task = Some(tokio::spawn(run_connection(request, outbound_rx, events_tx, shared)));
        Ok(())
    }

    async fn disconnect(&mut self, error: Option<String>) -> Result<(), TransportFailure> {
        self.outbound_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if claim_disconnect(&self.shared) {
            let _ = self.events_tx.send(TransportEvent::Disconnect(error));
        }
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<(), TransportFailure> {
        match &self.outbound_tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| TransportFailure::ThrewOnCall("connection task not running".into())),
            None => Err(TransportFailure::ThrewOnCall("not connected".into())),
        }
    }

    fn state(&self) -> TransportState {
        self.shared.lock().unwrap().state
    }

    fn take_events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events_rx.take().expect("take_events called twice")
    }
}

/// Owns the socket for the lifetime of one connection attempt. Dialing,
/// ping/pong, and the read/write loop mirror `UplinkSession`'s handling;
/// unlike it, every inbound/outbound outcome is surfaced as a
/// `TransportEvent` rather than returned from a blocking call, since the
/// client actor drives this asynchronously via its own event channel.
async fn run_connection(
    request: Request,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    shared: Arc<Mutex<Shared>>,
) {
    let ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            if claim_disconnect(&shared) {
                let _ = events_tx.send(TransportEvent::Disconnect(Some(e.to_string())));
            }
            return;
        }
    };
    shared.lock().unwrap().state = TransportState::Connected;
    let _ = events_tx.send(TransportEvent::Connect);

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if let Err(e) = write.send(Message::Text(frame.into())).await {
                            warn!(error = %e, "ws send failed");
                            if claim_disconnect(&shared) {
                                let _ = events_tx.send(TransportEvent::Disconnect(Some(e.to_string())));
                            }
                            return;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(t))) => {
                        let _ = events_tx.send(TransportEvent::Message(t.to_string()));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        if claim_disconnect(&shared) {
                            let _ = events_tx.send(TransportEvent::Disconnect(None));
                        }
                        return;
                    }
                    Some(Ok(Message::Binary(_) | Message::Frame(_))) => {
                        debug!("ignoring non-text frame");
                    }
                    Some(Err(e)) => {
                        if claim_disconnect(&shared) {
                            let _ = events_tx.send(TransportEvent::Disconnect(Some(e.to_string())));
                        }
                        return;
                    }
                }
            }
        }
    }
}

fn build_request(config: &WsTransportConfig) -> Result<Request, TransportFailure> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportFailure::ThrewOnCall(format!("invalid URL '{}': {e}", config.url)))?;
    for (name, value) in &config.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportFailure::ThrewOnCall(format!("invalid header name {name}: {e}")))?;
        let header_value = value
            .parse()
            .map_err(|e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                TransportFailure::ThrewOnCall(format!("invalid header value for {name}: {e}"))
            })?;
        request.headers_mut().insert(header_name, header_value);
    }
    Ok(request)
}
