//! Session state machine (§4.4): owns the transport-level lifecycle and the
//! handshake, and the connect/retry timers that drive it. Driven exclusively
//! by the client actor (`client.rs`); never touches feed state directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{sleep, Sleep};

use crate::config::ClientConfig;
use crate::error::FeedmeError;
use crate::protocol::{Handshake, HandshakeResponse, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
}

/// Per-session retry bookkeeping, mirroring the attempt/retry-streak
/// counters the teacher keeps on `AppState` for its own reconnect loop.
#[derive(Debug, Default)]
pub struct RetryCounters {
    connect_attempt: AtomicU64,
    retry_streak: AtomicU64,
}

impl RetryCounters {
    pub fn note_attempt(&self) {
        self.connect_attempt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_retry(&self) {
        self.retry_streak.fetch_add(1, Ordering::SeqCst);
        self.connect_attempt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.retry_streak.store(0, Ordering::SeqCst);
    }

    pub fn streak(&self) -> u64 {
        self.retry_streak.load(Ordering::SeqCst)
    }
}

pub struct Session {
    pub state: SessionState,
    pub config: ClientConfig,
    pub retries: RetryCounters,
    connect_timer: Option<Pin<Box<Sleep>>>,
    retry_timer: Option<Pin<Box<Sleep>>>,
    app_requested_disconnect: bool,
    handshake_rejected: bool,
}

use std::pin::Pin;

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            state: SessionState::Disconnected,
            config,
            retries: RetryCounters::default(),
            connect_timer: None,
            retry_timer: None,
            app_requested_disconnect: false,
            handshake_rejected: false,
        }
    }

    /// Application-initiated connect (`client.connect()`). Fails
    /// `INVALID_STATE` unless currently `Disconnected`.
    pub fn request_connect(&mut self) -> Result<(), FeedmeError> {
        if self.state != SessionState::Disconnected {
            return Err(FeedmeError::InvalidState(
                "connect() called while not disconnected".into(),
            ));
        }
        self.app_requested_disconnect = false;
        self.retries.reset();
        self.retries.note_attempt();
        self.enter_connecting();
        Ok(())
    }

    /// Application-initiated disconnect. Fails `INVALID_STATE` if already
    /// disconnected.
    pub fn request_disconnect(&mut self) -> Result<(), FeedmeError> {
        if self.state == SessionState::Disconnected {
            return Err(FeedmeError::InvalidState(
                "disconnect() called while already disconnected".into(),
            ));
        }
        self.app_requested_disconnect = true;
        self.state = SessionState::Disconnecting;
        self.disarm_all_timers();
        Ok(())
    }

    fn enter_connecting(&mut self) {
        self.state = SessionState::Connecting;
        if self.config.connect_timeout_ms > 0 {
            self.connect_timer = Some(Box::pin(sleep(Duration::from_millis(
                self.config.connect_timeout_ms,
            ))));
        }
    }

    /// Transport reported `connecting`; no session-state change, the
    /// connect timer (if any) keeps running.
    pub fn on_transport_connecting(&mut self) {}

    /// Transport reported `connect`; begin the handshake exchange.
    pub fn on_transport_connect(&mut self) -> Option<WireMessage> {
        if self.state != SessionState::Connecting {
            return None;
        }
        self.state = SessionState::Handshaking;
        Some(WireMessage::Handshake(Handshake {
            versions: vec!["1.0".to_string()],
        }))
    }

    /// Inbound `HandshakeResponse`. Returns `Ok(true)` if the session is now
    /// `Connected`, `Err` if the server rejected the handshake (terminal for
    /// this attempt, no retry).
    pub fn on_handshake_response(
        &mut self,
        response: &HandshakeResponse,
    ) -> Result<bool, FeedmeError> {
        if self.state != SessionState::Handshaking {
            // Transport silently moved on (e.g. disconnected) before this
            // response arrived; discard rather than raise badServerMessage,
            // since no state action is available.
            return Ok(false);
        }
        if response.success {
            self.state = SessionState::Connected;
            self.disarm_connect_timer();
            self.retries.reset();
            Ok(true)
        } else {
            self.state = SessionState::Disconnecting;
            self.handshake_rejected = true;
            self.disarm_all_timers();
            Err(FeedmeError::HandshakeRejected)
        }
    }

    /// Transport reported `disconnect`. Returns whether a reconnect attempt
    /// should be scheduled, and (if so) after how long.
    pub fn on_transport_disconnect(&mut self) -> ReconnectDecision {
        let was_connected = self.state == SessionState::Connected;
        let was_handshake_rejected = self.handshake_rejected;
        let app_requested = self.app_requested_disconnect;
        self.state = SessionState::Disconnected;
        self.disarm_all_timers();
        self.app_requested_disconnect = false;
        self.handshake_rejected = false;

        if app_requested || was_handshake_rejected {
            return ReconnectDecision::None;
        }
        if was_connected && !self.config.reconnect {
            return ReconnectDecision::None;
        }
        self.schedule_retry()
    }

    fn schedule_retry(&mut self) -> ReconnectDecision {
        if self.config.connect_retry_ms < 0 {
            return ReconnectDecision::None;
        }
        let attempt = self.retries.streak();
        if self.config.connect_retry_max_attempts > 0
            && attempt >= u64::from(self.config.connect_retry_max_attempts)
        {
            return ReconnectDecision::None;
        }
        let base = self.config.connect_retry_ms.max(0) as u64;
        let uncapped = base + attempt * self.config.connect_retry_backoff_ms;
        let delay = if self.config.connect_retry_max_ms == 0 {
            uncapped
        } else {
            uncapped.min(self.config.connect_retry_max_ms)
        };
        self.retries.note_retry();
        self.retry_timer = Some(Box::pin(sleep(Duration::from_millis(delay))));
        ReconnectDecision::After(Duration::from_millis(delay))
    }

    /// The retry timer fired; re-enter `Connecting` and tell the caller to
    /// call `transport.connect()`.
    pub fn on_retry_timer_fired(&mut self) {
        self.retry_timer = None;
        self.enter_connecting();
    }

    /// The connect timer fired while still `Connecting`/`Handshaking`;
    /// caller must disconnect the transport with a TIMEOUT error.
    pub fn on_connect_timer_fired(&mut self) -> bool {
        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Handshaking
        ) {
            self.connect_timer = None;
            self.state = SessionState::Disconnecting;
            true
        } else {
            false
        }
    }

    fn disarm_connect_timer(&mut self) {
        self.connect_timer = None;
    }

    fn disarm_all_timers(&mut self) {
        self.connect_timer = None;
        self.retry_timer = None;
    }

    /// Polls the armed connect timer, if any. Intended for use inside the
    /// client actor's `tokio::select!`.
    pub async fn connect_timer_fires(&mut self) {
        match &mut self.connect_timer {
            Some(timer) => timer.as_mut().await,
            None => std::future::pending().await,
        }
    }

    /// Polls the armed retry timer, if any.
    pub async fn retry_timer_fires(&mut self) {
        match &mut self.retry_timer {
            Some(timer) => timer.as_mut().await,
            None => std::future::pending().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    None,
    After(Duration),
}
