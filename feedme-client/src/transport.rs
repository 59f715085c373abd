//! Transport Adapter (§4.1, §6): the capability the core consumes from
//! whatever concrete connection mechanism a host application supplies, plus
//! the adapter that enforces its monotonic state-emission contract.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::error::TransportFailure;

/// Runs a transport call, turning a panic inside it into `ThrewOnCall`
/// rather than unwinding through the client actor task. The transport is a
/// caller-supplied implementation the core doesn't control, so a bug in it
/// must not take the whole actor down.
async fn catch_transport_panic<F>(fut: F) -> Result<(), TransportFailure>
where
    F: Future<Output = Result<(), TransportFailure>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(TransportFailure::ThrewOnCall(panic_message(&payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "transport panicked with a non-string payload".into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle and data emissions a transport must produce, matching the
/// `connecting` / `connect` / `disconnect` / `message` emission set.
#[derive(Clone)]
pub enum TransportEvent {
    Connecting,
    Connect,
    Disconnect(Option<String>),
    Message(String),
}

/// The narrow capability the core drives. A concrete implementation (e.g.
/// `feedme-ws-transport`'s websocket adapter) owns the real connection; this
/// crate never talks to a socket directly.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportFailure>;
    async fn disconnect(&mut self, error: Option<String>) -> Result<(), TransportFailure>;
    async fn send(&mut self, frame: String) -> Result<(), TransportFailure>;
    fn state(&self) -> TransportState;

    /// Takes ownership of the event receiver. Called once, at adapter
    /// construction; the adapter is the sole consumer of transport events
    /// thereafter.
    fn take_events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent>;
}

/// Wraps a `Box<dyn Transport>` and enforces the sequencing invariant: state
/// emissions must move `disconnected -> connecting -> connected` and back,
/// never skip or reorder. A violation surfaces as `TransportFailure` rather
/// than panicking the client actor.
pub struct TransportAdapter {
    inner: Box<dyn Transport>,
    last_observed: TransportState,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportAdapter {
    pub fn new(mut inner: Box<dyn Transport>) -> Self {
        let events = inner.take_events();
        Self {
            inner,
            last_observed: TransportState::Disconnected,
            events,
        }
    }

    pub async fn connect(&mut self) -> Result<(), TransportFailure> {
        catch_transport_panic(self.inner.connect()).await
    }

    pub async fn disconnect(&mut self, error: Option<String>) -> Result<(), TransportFailure> {
        catch_transport_panic(self.inner.disconnect(error)).await
    }

    pub async fn send(&mut self, frame: String) -> Result<(), TransportFailure> {
        if self.last_observed != TransportState::Connected {
            return Err(TransportFailure::UnexpectedEvent(
                "send called while transport not connected".into(),
            ));
        }
        catch_transport_panic(self.inner.send(frame)).await
    }

    pub fn state(&self) -> TransportState {
        self.last_observed
    }

    /// Awaits the next transport-level event, validating it against the
    /// monotonic sequencing contract before returning it. A validated
    /// `Disconnect` resets `last_observed` to `Disconnected` regardless of
    /// where it came from, since every non-disconnected state may legally
    /// drop.
    pub async fn next_event(&mut self) -> Result<TransportEvent, TransportFailure> {
        let event = self.events.recv().await.ok_or_else(|| {
            TransportFailure::UnexpectedEvent("transport event stream ended".into())
        })?;
        self.validate_and_apply(&event)?;
        Ok(event)
    }

    fn validate_and_apply(&mut self, event: &TransportEvent) -> Result<(), TransportFailure> {
        use TransportState::*;
        match (self.last_observed, event) {
            (Disconnected, TransportEvent::Connecting) => {
                self.last_observed = Connecting;
                Ok(())
            }
            (Connecting, TransportEvent::Connect) => {
                self.last_observed = Connected;
                Ok(())
            }
            (Connected, TransportEvent::Message(_)) => Ok(()),
            (Connecting | Connected, TransportEvent::Disconnect(_)) => {
                self.last_observed = Disconnected;
                Ok(())
            }
            (state, event) => Err(TransportFailure::UnexpectedEvent(format!(
                "transport emitted {event:?} while in state {state:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Connecting => write!(f, "Connecting"),
            TransportEvent::Connect => write!(f, "Connect"),
            TransportEvent::Disconnect(e) => write!(f, "Disconnect({e:?})"),
            TransportEvent::Message(_) => write!(f, "Message(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanicsOnConnect;

    #[async_trait]
    impl Transport for PanicsOnConnect {
        async fn connect(&mut self) -> Result<(), TransportFailure> {
            panic!("boom");
        }

        async fn disconnect(&mut self, _error: Option<String>) -> Result<(), TransportFailure> {
            Ok(())
        }

        async fn send(&mut self, _frame: String) -> Result<(), TransportFailure> {
            Ok(())
        }

        fn state(&self) -> TransportState {
            TransportState::Disconnected
        }

        fn take_events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
            mpsc::unbounded_channel().1
        }
    }

    #[tokio::test]
    async fn a_panicking_transport_call_surfaces_as_threw_on_call() {
        let mut adapter = TransportAdapter::new(Box::new(PanicsOnConnect));
        match adapter.connect().await {
            Err(TransportFailure::ThrewOnCall(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected ThrewOnCall, got {other:?}"),
        }
    }
}
