//! In-memory `Transport` double for exercising `feedme-client`'s actor without
//! a real socket, grounded on the paired client/server mock style used for
//! the protocol's own integration tests (connect/send/recv helpers around a
//! channel pair, rather than a real `tokio-tungstenite` connection).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use feedme_client::codec;
use feedme_client::protocol::WireMessage;
use feedme_client::{Transport, TransportEvent, TransportState};
use tokio::sync::mpsc;

/// The `Transport` half handed to `feedme_client::Client`.
pub struct MockTransport {
    sent: mpsc::UnboundedSender<String>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    state: Arc<Mutex<TransportState>>,
    fail_connect: Option<String>,
}

impl MockTransport {
    /// Returns a connected pair: the `Transport` implementation for the
    /// client actor, and a `MockServer` handle a test drives directly.
    pub fn pair() -> (Self, MockServer) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(TransportState::Disconnected));
        let transport = MockTransport {
            sent: sent_tx,
            events_tx: events_tx.clone(),
            events_rx: Some(events_rx),
            state: state.clone(),
            fail_connect: None,
        };
        let server = MockServer {
            sent_rx,
            events_tx,
            state,
        };
        (transport, server)
    }

    /// Like `pair`, but every `connect()` call fails immediately with
    /// `ThrewOnCall`, for exercising connect-attempt failure paths.
    pub fn pair_failing_connect(reason: impl Into<String>) -> (Self, MockServer) {
        let (mut transport, server) = Self::pair();
        transport.fail_connect = Some(reason.into());
        (transport, server)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), feedme_client::TransportFailure> {
        if let Some(reason) = &self.fail_connect {
            return Err(feedme_client::TransportFailure::ThrewOnCall(reason.clone()));
        }
        *self.state.lock().unwrap() = TransportState::Connecting;
        let _ = self.events_tx.send(TransportEvent::Connecting);
        Ok(())
    }

    async fn disconnect(&mut self, error: Option<String>) -> Result<(), feedme_client::TransportFailure> {
        *self.state.lock().unwrap() = TransportState::Disconnected;
        let _ = self.events_tx.send(TransportEvent::Disconnect(error));
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<(), feedme_client::TransportFailure> {
        self.sent
            .send(frame)
            .map_err(|_| feedme_client::TransportFailure::ThrewOnCall("mock server dropped".into()))
    }

    fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    fn take_events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events_rx.take().expect("take_events called twice")
    }
}

/// The test-side handle: inspects frames the client sent and injects
/// transport-level events (connect completion, inbound server frames,
/// disconnects) as a real server would.
pub struct MockServer {
    sent_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<Mutex<TransportState>>,
}

impl MockServer {
    /// Completes a connect that the client already started (i.e. after it
    /// observed `Connecting`), transitioning the mock to `Connected`.
    pub fn accept_connect(&self) {
        *self.state.lock().unwrap() = TransportState::Connected;
        let _ = self.events_tx.send(TransportEvent::Connect);
    }

    pub fn disconnect(&self, error: Option<String>) {
        *self.state.lock().unwrap() = TransportState::Disconnected;
        let _ = self.events_tx.send(TransportEvent::Disconnect(error));
    }

    /// Delivers a raw frame to the client as an inbound `Message` event.
    pub fn deliver_frame(&self, frame: impl Into<String>) {
        let _ = self.events_tx.send(TransportEvent::Message(frame.into()));
    }

    /// Encodes and delivers a typed message.
    pub fn deliver(&self, message: &WireMessage) {
        let frame = codec::encode(message).expect("message encodes");
        self.deliver_frame(frame);
    }

    /// Awaits the next raw frame the client sent.
    pub async fn recv_sent_frame(&mut self) -> Option<String> {
        self.sent_rx.recv().await
    }

    /// Awaits the next frame the client sent, decoded to a typed message.
    pub async fn recv_sent(&mut self) -> Option<WireMessage> {
        let frame = self.recv_sent_frame().await?;
        Some(codec::decode(&frame).expect("client only sends well-formed frames"))
    }

    pub fn observed_state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }
}
