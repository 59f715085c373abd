//! Public Surface, client half (§4.7), and the client actor that owns
//! `Session`, `Registry`, and `Dispatcher` exclusively and drives them from
//! a single `tokio::select!` loop (§5's "single-threaded cooperative"
//! scheduling model, realized the way the teacher's `run_session_loop`
//! realizes its own select-driven actor).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::dispatcher::{ActionCompletion, Dispatcher, Emission};
use crate::error::{FeedmeError, TransportFailure};
use crate::feed::{self, FeedEvent, FeedHandle};
use crate::protocol::{Action, ActionResponse, FeedArgs, WireMessage};
use crate::registry::{ActionLookup, FeedIdentity, HandleId, Registry};
use crate::session::{ReconnectDecision, Session};
use crate::transport::{Transport, TransportAdapter, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connecting,
    Connect,
    Disconnect(Option<FeedmeError>),
    BadServerMessage(FeedmeError),
    BadClientMessage(Value),
    TransportError(FeedmeError),
}

pub(crate) enum Command {
    Connect,
    Disconnect,
    Action {
        name: String,
        args: Value,
        completion: ActionCompletion,
    },
    CreateFeed {
        id: HandleId,
        identity: FeedIdentity,
        events: mpsc::UnboundedSender<FeedEvent>,
    },
    Feed(feed::Command),
}

/// The application-facing client. Cheap to `Clone`; every clone shares the
/// same underlying actor task via the command channel.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    connection_state: Arc<RwLock<ConnectionState>>,
    next_handle_id: Arc<AtomicU64>,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>, config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        let connection_state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let actor = ClientActor::new(
            transport,
            config,
            cmd_rx,
            event_tx.clone(),
            connection_state.clone(),
        );
        tokio::spawn(actor.run());
        Self {
            commands: cmd_tx,
            events: event_tx,
            connection_state,
            next_handle_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.read().unwrap().clone()
    }

    pub fn connect(&self) -> Result<(), FeedmeError> {
        let mut state = self.connection_state.write().unwrap();
        if *state != ConnectionState::Disconnected {
            return Err(FeedmeError::InvalidState(
                "connect() called while not disconnected".into(),
            ));
        }
        *state = ConnectionState::Connecting;
        drop(state);
        let _ = self.commands.send(Command::Connect);
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), FeedmeError> {
        let mut state = self.connection_state.write().unwrap();
        if *state == ConnectionState::Disconnected {
            return Err(FeedmeError::InvalidState(
                "disconnect() called while already disconnected".into(),
            ));
        }
        *state = ConnectionState::Disconnecting;
        drop(state);
        let _ = self.commands.send(Command::Disconnect);
        Ok(())
    }

    pub fn feed(&self, name: impl Into<String>, args: FeedArgs) -> FeedHandle {
        let identity = FeedIdentity::new(name, args);
        let id = HandleId(self.next_handle_id.fetch_add(1, Ordering::SeqCst));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::CreateFeed {
            id,
            identity: identity.clone(),
            events: event_tx,
        });
        FeedHandle::new(id, identity, self.commands.clone(), event_rx)
    }

    /// Future-style action call. If the session is not `Connected`, the
    /// returned future resolves to `Err(FeedmeError::Disconnected)`.
    pub async fn action(
        &self,
        name: impl Into<String>,
        args: Value,
    ) -> Result<Value, FeedmeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Action {
                name: name.into(),
                args,
                completion: ActionCompletion::Oneshot(tx),
            })
            .map_err(|_| FeedmeError::Disconnected)?;
        rx.await.map_err(|_| FeedmeError::Disconnected)?
    }

    /// Callback-style action call; returns immediately.
    pub fn action_with_callback(
        &self,
        name: impl Into<String>,
        args: Value,
        callback: impl FnOnce(Result<Value, FeedmeError>) + Send + 'static,
    ) {
        let _ = self.commands.send(Command::Action {
            name: name.into(),
            args,
            completion: ActionCompletion::Callback(Box::new(callback)),
        });
    }
}

/// Owns every piece of mutable client state; never shared outside this task.
struct ClientActor {
    transport: TransportAdapter,
    session: Session,
    registry: Registry,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    connection_state: Arc<RwLock<ConnectionState>>,
    feed_events: std::collections::HashMap<HandleId, mpsc::UnboundedSender<FeedEvent>>,
    next_callback_id: u64,
    schema: jsonschema::Validator,
    /// Wire messages queued by a reconciliation pass that ran from a
    /// synchronous command handler; flushed to the transport once control
    /// returns to `run`'s loop body.
    pending_outbound: Vec<WireMessage>,
    /// Set when the session itself initiates a disconnect for a known
    /// reason (handshake rejection, connect timeout) so the eventual
    /// transport `Disconnect` event can carry that reason through to the
    /// application instead of a bare `None`.
    pending_disconnect_error: Option<FeedmeError>,
}

impl ClientActor {
    fn new(
        transport: Box<dyn Transport>,
        config: ClientConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<ClientEvent>,
        connection_state: Arc<RwLock<ConnectionState>>,
    ) -> Self {
        let registry = Registry::new(
            config.reopen_max_attempts,
            config.reopen_trailing_ms,
            config.action_timeout_ms,
            config.feed_timeout_ms,
        );
        Self {
            transport: TransportAdapter::new(transport),
            session: Session::new(config),
            registry,
            dispatcher: Dispatcher::new(),
            commands,
            events,
            connection_state,
            feed_events: std::collections::HashMap::new(),
            next_callback_id: 0,
            schema: crate::codec::compile_schema(),
            pending_outbound: Vec::new(),
            pending_disconnect_error: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.session.connect_timer_fires() => {
                    self.handle_connect_timeout().await;
                }

                _ = self.session.retry_timer_fires() => {
                    self.handle_retry_timer().await;
                }

                _ = self.next_deadline_wakeup() => {
                    self.handle_deadline_wakeup().await;
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }

                event = self.transport.next_event() => {
                    self.handle_transport_event(event).await;
                }
            }
            self.drain_dispatcher();
            self.flush_outbound().await;
        }
    }

    /// Sleeps until the registry's earliest pending deadline (an action
    /// timeout, a feed-open timeout, or a reopen-throttle window freeing up),
    /// or forever if nothing is pending. Recomputed fresh on every loop
    /// iteration, so a deadline registered mid-iteration is picked up on the
    /// next `select!` poll without any separate cancellation bookkeeping.
    async fn next_deadline_wakeup(&self) {
        match self.registry.next_deadline() {
            Some(instant) => tokio::time::sleep_until(instant).await,
            None => std::future::pending().await,
        }
    }

    async fn handle_deadline_wakeup(&mut self) {
        let (settled, outbound) = self.registry.expire_deadlines(&mut self.dispatcher);
        for completion in settled {
            completion.settle(Err(FeedmeError::Timeout));
        }
        self.pending_outbound.extend(outbound);
        self.reconcile_and_send_later();
    }

    async fn flush_outbound(&mut self) {
        let pending = std::mem::take(&mut self.pending_outbound);
        for message in pending {
            self.send(message).await;
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                if self.session.request_connect().is_ok() {
                    self.set_connection_state(ConnectionState::Connecting);
                    if let Err(e) = self.transport.connect().await {
                        warn!(error = %e, "transport.connect() failed");
                        self.dispatcher
                            .push(Emission::ClientEvent(ClientEvent::TransportError(e.into())));
                    }
                }
            }
            Command::Disconnect => {
                if self.session.request_disconnect().is_ok() {
                    let _ = self.transport.disconnect(None).await;
                }
            }
            Command::Action {
                name,
                args,
                completion,
            } => {
                self.handle_action_request(name, args, completion).await;
            }
            Command::CreateFeed { id, identity, events } => {
                self.registry.create_handle(id, identity);
                self.feed_events.insert(id, events);
            }
            Command::Feed(feed_cmd) => self.handle_feed_command(feed_cmd),
        }
    }

    async fn handle_action_request(
        &mut self,
        name: String,
        args: Value,
        completion: ActionCompletion,
    ) {
        if !self.session.is_connected() {
            completion.settle(Err(FeedmeError::Disconnected));
            return;
        }
        let callback_id = format!("{}-{}", uuid::Uuid::new_v4(), self.next_callback_id);
        self.next_callback_id += 1;
        self.registry.register_action(callback_id.clone(), completion);
        let frame = WireMessage::Action(Action {
            action_name: name,
            action_args: args,
            callback_id,
        });
        self.send(frame).await;
    }

    fn handle_feed_command(&mut self, cmd: feed::Command) {
        match cmd {
            feed::Command::DesireOpen(id) => {
                let _ = self.registry.desire_open(id);
                self.reconcile_and_send_later();
            }
            feed::Command::DesireClosed(id) => {
                let _ = self.registry.desire_closed(id);
                self.reconcile_and_send_later();
            }
            feed::Command::Destroy(id) => {
                let _ = self.registry.destroy(id);
                self.feed_events.remove(&id);
            }
            feed::Command::Data(id, reply) => {
                let _ = reply.send(self.registry.data_of(id));
            }
        }
    }

    /// Reconciliation itself is synchronous; the resulting wire messages are
    /// queued here and flushed with `flush_outbound` once control returns to
    /// `run`'s loop body, keeping every transport `.await` off the hot path
    /// of a single command/event handler.
    fn reconcile_and_send_later(&mut self) {
        let outbound = self
            .registry
            .reconcile(self.session.is_connected(), &mut self.dispatcher);
        self.pending_outbound.extend(outbound);
    }

    async fn handle_transport_event(&mut self, event: Result<TransportEvent, TransportFailure>) {
        match event {
            Err(e) => {
                self.dispatcher
                    .push(Emission::ClientEvent(ClientEvent::TransportError(e.into())));
            }
            Ok(TransportEvent::Connecting) => {
                self.session.on_transport_connecting();
                self.dispatcher.push(Emission::ClientEvent(ClientEvent::Connecting));
            }
            Ok(TransportEvent::Connect) => {
                if let Some(handshake) = self.session.on_transport_connect() {
                    self.send(handshake).await;
                }
            }
            Ok(TransportEvent::Message(frame)) => {
                self.handle_inbound_frame(&frame).await;
            }
            Ok(TransportEvent::Disconnect(_)) => {
                self.handle_disconnect();
            }
        }
    }

    fn handle_disconnect(&mut self) {
        // Ordering contract (§4.6 rule 1): actions settle, then feed
        // closures, then the client `disconnect` event.
        for completion in self.registry.fail_all_actions_disconnected() {
            completion.settle(Err(FeedmeError::Disconnected));
        }
        for handle_id in self.registry.handles_to_close_on_disconnect() {
            self.dispatcher.push(Emission::FeedClose(
                handle_id,
                Some(FeedmeError::Disconnected),
            ));
        }
        let decision = self.session.on_transport_disconnect();
        self.set_connection_state(ConnectionState::Disconnected);
        let error = self.pending_disconnect_error.take();
        self.dispatcher
            .push(Emission::ClientEvent(ClientEvent::Disconnect(error)));
        if let ReconnectDecision::After(_delay) = decision {
            info!("scheduling reconnect attempt");
        }
    }

    async fn handle_connect_timeout(&mut self) {
        if self.session.on_connect_timer_fired() {
            self.pending_disconnect_error = Some(FeedmeError::Timeout);
            let _ = self
                .transport
                .disconnect(Some("TIMEOUT".to_string()))
                .await;
        }
    }

    async fn handle_retry_timer(&mut self) {
        self.session.on_retry_timer_fired();
        if let Err(e) = self.transport.connect().await {
            warn!(error = %e, "retry transport.connect() failed");
        }
    }

    async fn handle_inbound_frame(&mut self, frame: &str) {
        if let Err(e) = crate::codec::validate_schema(frame, &self.schema) {
            self.dispatcher.push(Emission::ClientEvent(ClientEvent::BadServerMessage(
                FeedmeError::InvalidMessage(e.to_string()),
            )));
            return;
        }
        let message = match crate::codec::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                self.dispatcher.push(Emission::ClientEvent(ClientEvent::BadServerMessage(
                    FeedmeError::InvalidMessage(e.to_string()),
                )));
                return;
            }
        };
        self.apply_message(message).await;
    }

    async fn apply_message(&mut self, message: WireMessage) {
        match message {
            WireMessage::HandshakeResponse(resp) => match self.session.on_handshake_response(&resp) {
                Ok(true) => {
                    self.set_connection_state(ConnectionState::Connected);
                    self.registry.reset_reopen_counters();
                    self.dispatcher
                        .push(Emission::ClientEvent(ClientEvent::Connect));
                    self.reconcile_and_send_later();
                }
                Ok(false) => {}
                Err(e) => {
                    self.pending_disconnect_error = Some(e);
                    let _ = self.transport.disconnect(Some("HANDSHAKE_REJECTED".into())).await;
                }
            },
            WireMessage::ActionResponse(resp) => self.apply_action_response(resp),
            WireMessage::FeedOpenResponse(resp) => self.apply_feed_open_response(resp),
            WireMessage::FeedCloseResponse(resp) => {
                let identity = FeedIdentity::new(resp.feed_name, resp.feed_args);
                self.registry.on_feed_close_response(&identity);
                self.reconcile_and_send_later();
            }
            WireMessage::ActionRevelation(rev) => self.apply_action_revelation(rev),
            WireMessage::FeedTermination(term) => {
                let identity = FeedIdentity::new(term.feed_name, term.feed_args);
                self.registry.on_feed_termination(&identity, &mut self.dispatcher);
                self.reconcile_and_send_later();
            }
            WireMessage::ViolationResponse(v) => {
                self.dispatcher
                    .push(Emission::ClientEvent(ClientEvent::BadClientMessage(v.diagnostics)));
            }
            WireMessage::Handshake(_)
            | WireMessage::Action(_)
            | WireMessage::FeedOpen(_)
            | WireMessage::FeedClose(_) => {
                // Outbound-only shapes; receiving one from the server is a
                // protocol violation.
                self.dispatcher.push(Emission::ClientEvent(ClientEvent::BadServerMessage(
                    FeedmeError::UnexpectedMessage("received a client-to-server message shape".into()),
                )));
            }
        }
    }

    fn apply_action_response(&mut self, resp: ActionResponse) {
        let callback_id = resp.callback_id().to_string();
        let pending = match self.registry.take_action(&callback_id) {
            ActionLookup::Found(pending) => pending,
            // Late response to an action that already timed out client-side.
            ActionLookup::Expired => return,
            ActionLookup::Unknown => {
                self.dispatcher.push(Emission::ClientEvent(ClientEvent::BadServerMessage(
                    FeedmeError::UnexpectedMessage(format!("unknown callback id {callback_id}")),
                )));
                return;
            }
        };
        match resp {
            ActionResponse::Success { action_data, .. } => {
                pending.completion.settle(Ok(action_data));
            }
            ActionResponse::Failure {
                error_code,
                error_data,
                ..
            } => {
                pending.completion.settle(Err(FeedmeError::Rejected {
                    error_code,
                    error_data,
                }));
            }
        }
    }

    fn apply_feed_open_response(&mut self, resp: crate::protocol::FeedOpenResponse) {
        use crate::protocol::FeedOpenResponse::*;
        match resp {
            Success {
                feed_name,
                feed_args,
                feed_data,
                ..
            } => {
                let identity = FeedIdentity::new(feed_name, feed_args);
                self.registry
                    .on_feed_open_response_success(&identity, feed_data, &mut self.dispatcher);
            }
            Failure {
                feed_name,
                feed_args,
                error_code,
                error_data,
                ..
            } => {
                let identity = FeedIdentity::new(feed_name, feed_args);
                self.registry.on_feed_open_response_failure(
                    &identity,
                    error_code,
                    error_data,
                    &mut self.dispatcher,
                );
            }
        }
        self.reconcile_and_send_later();
    }

    fn apply_action_revelation(&mut self, rev: crate::protocol::ActionRevelation) {
        let identity = FeedIdentity::new(rev.feed_name.clone(), rev.feed_args.clone());
        let Some(current) = self.registry.data_of_unchecked(&identity) else {
            // No server feed record, or it never held data (never opened) --
            // nothing to reveal against.
            return;
        };
        let delta_result = crate::delta::apply_deltas(&current, &rev.feed_deltas);
        let hash_check = rev.feed_md5.as_ref().and_then(|expected| {
            delta_result.as_ref().ok().map(|tree| {
                if crate::codec::md5_hex(tree) == *expected {
                    Ok(())
                } else {
                    Err(())
                }
            })
        });
        let immediate_close = self.registry.on_action_revelation(
            &identity,
            rev.action_name,
            rev.action_data,
            delta_result,
            hash_check,
            &mut self.dispatcher,
        );
        self.pending_outbound.extend(immediate_close);
        self.reconcile_and_send_later();
    }

    async fn send(&mut self, message: WireMessage) {
        match crate::codec::encode(&message) {
            Ok(frame) => {
                if let Err(e) = self.transport.send(frame).await {
                    warn!(error = %e, "send failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode outbound message"),
        }
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        *self.connection_state.write().unwrap() = state;
    }

    fn drain_dispatcher(&mut self) {
        while let Some(emission) = self.dispatcher.pop() {
            self.deliver(emission);
        }
    }

    fn deliver(&mut self, emission: Emission) {
        match emission {
            Emission::ClientEvent(event) => {
                debug!(?event, "client event");
                let _ = self.events.send(event);
            }
            Emission::FeedOpening(id) => self.send_feed_event(id, FeedEvent::Opening),
            Emission::FeedOpen(id, data) => self.send_feed_event(id, FeedEvent::Open(data)),
            Emission::FeedClose(id, err) => self.send_feed_event(id, FeedEvent::Close(err)),
            Emission::ActionRevealed(id, name, action_data, new_data, old_data) => {
                self.send_feed_event(
                    id,
                    FeedEvent::Action {
                        name,
                        action_data,
                        new_data,
                        old_data,
                    },
                )
            }
        }
    }

    fn send_feed_event(&self, id: HandleId, event: FeedEvent) {
        if let Some(tx) = self.feed_events.get(&id) {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        write!(f, "{s}")
    }
}
