//! Client / Feed Registry (§4.5): reconciles per-identity server-feed state
//! against the union of handle desires, correlates action requests, and
//! applies reopen throttling after server-caused feed closures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::dispatcher::{ActionCompletion, Dispatcher, Emission};
use crate::error::FeedmeError;
use crate::protocol::{FeedArgs, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedIdentity {
    pub name: String,
    pub args: FeedArgsKey,
}

/// `FeedArgs` (a `BTreeMap`) already orders consistently, so it can serve
/// directly as a hashable, comparable identity key.
pub type FeedArgsKey = FeedArgs;

impl FeedIdentity {
    pub fn new(name: impl Into<String>, args: FeedArgs) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFeedState {
    Closed,
    Opening,
    Open,
    Closing,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desired {
    Open,
    Closed,
}

struct HandleRecord {
    identity: FeedIdentity,
    desired: Desired,
    destroyed: bool,
}

struct ServerFeedRecord {
    state: ServerFeedState,
    data: Option<Value>,
    handles: Vec<HandleId>,
    reopen_events: VecDeque<Instant>,
    /// Set when a reopen is deferred past the throttle limit; cleared once
    /// the window frees a slot or the session reconnects.
    reopen_deferred: bool,
    /// Armed when the feed enters `Opening`; if a FeedOpenResponse hasn't
    /// arrived by this deadline, the open is timed out client-side (§4.4).
    open_deadline: Option<Instant>,
}

impl ServerFeedRecord {
    fn new() -> Self {
        Self {
            state: ServerFeedState::Closed,
            data: None,
            handles: Vec::new(),
            reopen_events: VecDeque::new(),
            reopen_deferred: false,
            open_deadline: None,
        }
    }

    fn any_desired_open(&self, handles: &HashMap<HandleId, HandleRecord>) -> bool {
        self.handles.iter().any(|id| {
            handles
                .get(id)
                .is_some_and(|h| !h.destroyed && h.desired == Desired::Open)
        })
    }
}

pub struct PendingAction {
    pub completion: ActionCompletion,
    deadline: Option<Instant>,
}

pub struct Registry {
    handles: HashMap<HandleId, HandleRecord>,
    feeds: HashMap<FeedIdentity, ServerFeedRecord>,
    actions: HashMap<String, PendingAction>,
    /// Callback ids of actions that timed out, retained only long enough to
    /// distinguish "late response to a timed-out action" (silently dropped)
    /// from "response to an id that was never issued" (a protocol
    /// violation) the next time that id is seen.
    timed_out_actions: HashSet<String>,
    reopen_max_attempts: i32,
    reopen_trailing_ms: u64,
    action_timeout_ms: u64,
    feed_timeout_ms: u64,
}

/// Result of correlating an inbound `ActionResponse` against the pending set.
pub enum ActionLookup {
    Found(PendingAction),
    /// The action already timed out; the response is a late arrival and
    /// must be silently discarded rather than flagged.
    Expired,
    /// No action was ever registered under this id.
    Unknown,
}

/// Output of a reconciliation pass: outbound wire messages the caller must
/// hand to the session/transport, in order.
pub type OutboundMessages = Vec<WireMessage>;

impl Registry {
    pub fn new(
        reopen_max_attempts: i32,
        reopen_trailing_ms: u64,
        action_timeout_ms: u64,
        feed_timeout_ms: u64,
    ) -> Self {
        Self {
            handles: HashMap::new(),
            feeds: HashMap::new(),
            actions: HashMap::new(),
            timed_out_actions: HashSet::new(),
            reopen_max_attempts,
            reopen_trailing_ms,
            action_timeout_ms,
            feed_timeout_ms,
        }
    }

    /// Registers a handle under an id the caller already allocated (the
    /// public `Client::feed` call mints ids synchronously so it can return a
    /// `FeedHandle` without a round trip through the actor).
    pub fn create_handle(&mut self, id: HandleId, identity: FeedIdentity) {
        self.handles.insert(
            id,
            HandleRecord {
                identity: identity.clone(),
                desired: Desired::Closed,
                destroyed: false,
            },
        );
        self.feeds
            .entry(identity)
            .or_insert_with(ServerFeedRecord::new)
            .handles
            .push(id);
    }

    pub fn desire_open(&mut self, id: HandleId) -> Result<(), FeedmeError> {
        let record = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| FeedmeError::InvalidArgument("unknown feed handle".into()))?;
        if record.destroyed {
            return Err(FeedmeError::Destroyed);
        }
        if record.desired == Desired::Open {
            return Err(FeedmeError::InvalidFeedState("already desired open".into()));
        }
        record.desired = Desired::Open;
        Ok(())
    }

    pub fn desire_closed(&mut self, id: HandleId) -> Result<(), FeedmeError> {
        let record = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| FeedmeError::InvalidArgument("unknown feed handle".into()))?;
        if record.destroyed {
            return Err(FeedmeError::Destroyed);
        }
        if record.desired == Desired::Closed {
            return Err(FeedmeError::InvalidFeedState("already desired closed".into()));
        }
        record.desired = Desired::Closed;
        Ok(())
    }

    pub fn destroy(&mut self, id: HandleId) -> Result<(), FeedmeError> {
        let record = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| FeedmeError::InvalidArgument("unknown feed handle".into()))?;
        if record.destroyed {
            return Err(FeedmeError::Destroyed);
        }
        if record.desired != Desired::Closed {
            return Err(FeedmeError::InvalidFeedState(
                "must desire closed before destroy".into(),
            ));
        }
        record.destroyed = true;
        self.gc_feed(&record.identity.clone());
        Ok(())
    }

    pub fn identity_of(&self, id: HandleId) -> Option<&FeedIdentity> {
        self.handles.get(&id).map(|r| &r.identity)
    }

    pub fn data_of(&self, id: HandleId) -> Result<Value, FeedmeError> {
        let record = self
            .handles
            .get(&id)
            .ok_or_else(|| FeedmeError::InvalidArgument("unknown feed handle".into()))?;
        if record.destroyed {
            return Err(FeedmeError::Destroyed);
        }
        if record.desired != Desired::Open {
            return Err(FeedmeError::InvalidFeedState("not desired open".into()));
        }
        let feed = self.feeds.get(&record.identity).unwrap();
        if feed.state != ServerFeedState::Open {
            return Err(FeedmeError::InvalidFeedState("server feed not open".into()));
        }
        Ok(feed.data.clone().unwrap_or(Value::Null))
    }

    /// The feed's last-known data tree regardless of any handle's desired
    /// state, for use by the revelation pipeline which must apply deltas
    /// against the authoritative tree before any per-handle checks apply.
    pub fn data_of_unchecked(&self, identity: &FeedIdentity) -> Option<Value> {
        self.feeds.get(identity).and_then(|f| f.data.clone())
    }

    #[cfg(test)]
    fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    #[cfg(test)]
    fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Drops a feed's bookkeeping once nothing references it anymore:
    /// every handle that was ever attached to it has been destroyed, and the
    /// server-side feed has settled into a terminal state. Called after every
    /// transition into `Closed`/`Terminated` as well as from `destroy()`,
    /// since the handle that triggers the settling isn't always the last one
    /// destroyed, and the feed isn't always terminal when `destroy()` runs.
    fn gc_feed(&mut self, identity: &FeedIdentity) {
        let Some(feed) = self.feeds.get(identity) else {
            return;
        };
        let no_live_handles = feed
            .handles
            .iter()
            .all(|id| self.handles.get(id).is_none_or(|h| h.destroyed));
        if no_live_handles
            && matches!(feed.state, ServerFeedState::Closed | ServerFeedState::Terminated)
        {
            if let Some(feed) = self.feeds.remove(identity) {
                for handle_id in feed.handles {
                    self.handles.remove(&handle_id);
                }
            }
        }
    }

    /// Recomputes the required action for every server feed and returns the
    /// wire messages that must be sent, per the reconciliation table (§4.5).
    /// Called whenever a desire changes, a response/termination arrives, the
    /// session connects/disconnects, or a reopen window frees a slot.
    pub fn reconcile(&mut self, session_connected: bool, dispatcher: &mut Dispatcher) -> OutboundMessages {
        if !session_connected {
            return Vec::new();
        }
        let identities: Vec<FeedIdentity> = self.feeds.keys().cloned().collect();
        let mut outbound = Vec::new();
        for identity in identities {
            let any_open = {
                let feed = self.feeds.get(&identity).unwrap();
                feed.any_desired_open(&self.handles)
            };
            let open_deadline = self.feed_open_deadline();
            let feed = self.feeds.get_mut(&identity).unwrap();
            match (feed.state, any_open) {
                (ServerFeedState::Closed, true) => {
                    feed.state = ServerFeedState::Opening;
                    feed.open_deadline = open_deadline;
                    for handle_id in feed.handles.clone() {
                        dispatcher.push(Emission::FeedOpening(handle_id));
                    }
                    outbound.push(open_message(&identity));
                }
                (ServerFeedState::Open, false) => {
                    feed.state = ServerFeedState::Closing;
                    outbound.push(close_message(&identity));
                }
                (ServerFeedState::Terminated, true) => {
                    if self.reopen_permit(&identity) {
                        let feed = self.feeds.get_mut(&identity).unwrap();
                        feed.state = ServerFeedState::Opening;
                        feed.open_deadline = open_deadline;
                        for handle_id in feed.handles.clone() {
                            dispatcher.push(Emission::FeedOpening(handle_id));
                        }
                        outbound.push(open_message(&identity));
                    }
                }
                _ => {}
            }
        }
        outbound
    }

    /// Checks whether a reopen may proceed right now under the throttle,
    /// and if so records it as one of the R events counted against the
    /// window -- granting and counting happen together so every permitted
    /// reopen, and only a permitted reopen, consumes a slot. Deferred
    /// reopens are retried by the caller on the next `reopen_window_wakeup`
    /// timer fire.
    fn reopen_permit(&mut self, identity: &FeedIdentity) -> bool {
        let feed = self.feeds.get_mut(identity).unwrap();
        if self.reopen_max_attempts < 0 {
            return true;
        }
        if self.reopen_max_attempts == 0 {
            feed.reopen_deferred = true;
            return false;
        }
        if self.reopen_trailing_ms > 0 {
            let cutoff = Instant::now() - Duration::from_millis(self.reopen_trailing_ms);
            while feed
                .reopen_events
                .front()
                .is_some_and(|t| *t < cutoff)
            {
                feed.reopen_events.pop_front();
            }
        }
        if (feed.reopen_events.len() as i32) < self.reopen_max_attempts {
            feed.reopen_events.push_back(Instant::now());
            feed.reopen_deferred = false;
            true
        } else {
            feed.reopen_deferred = true;
            false
        }
    }

    fn feed_open_deadline(&self) -> Option<Instant> {
        if self.feed_timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(self.feed_timeout_ms))
        } else {
            None
        }
    }

    /// Duration until the earliest deferred reopen's window frees a slot,
    /// if any feed currently has a deferred reopen and a trailing window
    /// configured. Used to arm the registry's own wakeup timer.
    pub fn next_reopen_wakeup(&self) -> Option<Duration> {
        if self.reopen_trailing_ms == 0 {
            return None;
        }
        self.feeds
            .values()
            .filter(|f| f.reopen_deferred)
            .filter_map(|f| f.reopen_events.front())
            .map(|earliest| {
                let deadline = *earliest + Duration::from_millis(self.reopen_trailing_ms);
                deadline.saturating_duration_since(Instant::now())
            })
            .min()
    }

    /// Resets every feed's reopen counter; called on a successful session
    /// reconnect (R > 0, trailing_ms = 0 counts per-session-lifetime).
    pub fn reset_reopen_counters(&mut self) {
        for feed in self.feeds.values_mut() {
            feed.reopen_events.clear();
            feed.reopen_deferred = false;
        }
    }

    /// Filters `handle_ids` down to the ones still desired open, for
    /// emissions that must only reach handles desired open on this feed
    /// (§4.5 point 4) -- a handle that called `desire_closed()` while the
    /// server feed was still settling must not see a stale `Open`/revelation
    /// land after it already asked to leave.
    fn handles_desired_open(&self, handle_ids: &[HandleId]) -> Vec<HandleId> {
        handle_ids
            .iter()
            .copied()
            .filter(|id| {
                self.handles
                    .get(id)
                    .is_some_and(|h| !h.destroyed && h.desired == Desired::Open)
            })
            .collect()
    }

    pub fn on_feed_open_response_success(
        &mut self,
        identity: &FeedIdentity,
        data: Value,
        dispatcher: &mut Dispatcher,
    ) {
        let Some(feed) = self.feeds.get_mut(identity) else {
            return;
        };
        if feed.state != ServerFeedState::Opening {
            return;
        }
        feed.state = ServerFeedState::Open;
        feed.open_deadline = None;
        feed.data = Some(data.clone());
        let handles = feed.handles.clone();
        for handle_id in self.handles_desired_open(&handles) {
            dispatcher.push(Emission::FeedOpen(handle_id, data.clone()));
        }
    }

    pub fn on_feed_open_response_failure(
        &mut self,
        identity: &FeedIdentity,
        error_code: String,
        error_data: Value,
        dispatcher: &mut Dispatcher,
    ) {
        let Some(feed) = self.feeds.get_mut(identity) else {
            return;
        };
        if feed.state != ServerFeedState::Opening {
            return;
        }
        feed.state = ServerFeedState::Closed;
        feed.open_deadline = None;
        for handle_id in feed.handles.clone() {
            dispatcher.push(Emission::FeedClose(
                handle_id,
                Some(FeedmeError::Rejected {
                    error_code: error_code.clone(),
                    error_data: error_data.clone(),
                }),
            ));
        }
        self.gc_feed(identity);
    }

    pub fn on_feed_close_response(&mut self, identity: &FeedIdentity) {
        let Some(feed) = self.feeds.get_mut(identity) else {
            return;
        };
        if feed.state == ServerFeedState::Closing {
            feed.state = ServerFeedState::Closed;
            feed.data = None;
        }
        self.gc_feed(identity);
    }

    pub fn on_feed_termination(&mut self, identity: &FeedIdentity, dispatcher: &mut Dispatcher) {
        let Some(feed) = self.feeds.get_mut(identity) else {
            return;
        };
        match feed.state {
            ServerFeedState::Open => {
                feed.state = ServerFeedState::Terminated;
                feed.data = None;
                let handles = feed.handles.clone();
                for handle_id in self.handles_desired_open(&handles) {
                    dispatcher.push(Emission::FeedClose(handle_id, Some(FeedmeError::Terminated {
                        error_code: "TERMINATED".into(),
                        error_data: Value::Null,
                    })));
                }
            }
            ServerFeedState::Closing => {
                // Silently consumed.
            }
            _ => {}
        }
        self.gc_feed(identity);
    }

    /// Applies an action revelation (§4.5 step-by-step) to a feed currently
    /// `open`. Silently discards if the feed is `closing`. On a hash or delta
    /// failure the feed is moved to `terminated` (so the next reconciliation
    /// reopens it subject to the throttle, same as a server-sent
    /// `FeedTermination`) and the immediate `FeedClose` the failure requires
    /// is handed back to the caller to send.
    pub fn on_action_revelation(
        &mut self,
        identity: &FeedIdentity,
        action_name: String,
        action_data: Value,
        new_data: Result<Value, crate::error::DeltaError>,
        hash_check: Option<Result<(), ()>>,
        dispatcher: &mut Dispatcher,
    ) -> Option<WireMessage> {
        let Some(feed) = self.feeds.get_mut(identity) else {
            return None;
        };
        if feed.state == ServerFeedState::Closing {
            return None;
        }
        if feed.state != ServerFeedState::Open {
            return None;
        }
        let new_tree = match new_data {
            Err(e) => {
                feed.state = ServerFeedState::Terminated;
                feed.data = None;
                let handles = feed.handles.clone();
                dispatcher.push(Emission::ClientEvent(crate::client::ClientEvent::BadServerMessage(
                    FeedmeError::InvalidDelta(e.to_string()),
                )));
                for handle_id in self.handles_desired_open(&handles) {
                    dispatcher.push(Emission::FeedClose(
                        handle_id,
                        Some(FeedmeError::BadActionRevelation(
                            "the server passed an invalid feed delta".into(),
                        )),
                    ));
                }
                self.gc_feed(identity);
                return Some(close_message(identity));
            }
            Ok(tree) => tree,
        };
        if let Some(Err(())) = hash_check {
            let feed = self.feeds.get_mut(identity).unwrap();
            feed.state = ServerFeedState::Terminated;
            feed.data = None;
            let handles = feed.handles.clone();
            dispatcher.push(Emission::ClientEvent(crate::client::ClientEvent::BadServerMessage(
                FeedmeError::InvalidHash("hash verification failed".into()),
            )));
            for handle_id in self.handles_desired_open(&handles) {
                dispatcher.push(Emission::FeedClose(
                    handle_id,
                    Some(FeedmeError::BadActionRevelation(
                        "hash verification failed".into(),
                    )),
                ));
            }
            self.gc_feed(identity);
            return Some(close_message(identity));
        }
        let feed = self.feeds.get_mut(identity).unwrap();
        let old_tree = feed.data.clone().unwrap_or(Value::Null);
        feed.data = Some(new_tree.clone());
        for handle_id in feed.handles.clone() {
            dispatcher.push(Emission::ActionRevealed(
                handle_id,
                action_name.clone(),
                action_data.clone(),
                new_tree.clone(),
                old_tree.clone(),
            ));
        }
        None
    }

    pub fn register_action(&mut self, callback_id: String, completion: ActionCompletion) {
        let deadline = if self.action_timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(self.action_timeout_ms))
        } else {
            None
        };
        self.actions
            .insert(callback_id, PendingAction { completion, deadline });
    }

    pub fn take_action(&mut self, callback_id: &str) -> ActionLookup {
        if let Some(pending) = self.actions.remove(callback_id) {
            ActionLookup::Found(pending)
        } else if self.timed_out_actions.remove(callback_id) {
            ActionLookup::Expired
        } else {
            ActionLookup::Unknown
        }
    }

    /// Earliest of: an action deadline, a feed-open deadline, or the next
    /// reopen-throttle window freeing a slot. `None` if nothing is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        let action_min = self.actions.values().filter_map(|a| a.deadline).min();
        let feed_min = self.feeds.values().filter_map(|f| f.open_deadline).min();
        let reopen_min = self.next_reopen_wakeup().map(|d| Instant::now() + d);
        [action_min, feed_min, reopen_min].into_iter().flatten().min()
    }

    /// Settles every action whose deadline has passed with `TIMEOUT`, and
    /// times out every feed still `Opening` past its own deadline, returning
    /// the FeedClose messages that must be sent to the server for the
    /// latter. Late responses that arrive after this point simply find
    /// nothing left to correlate against.
    pub fn expire_deadlines(
        &mut self,
        dispatcher: &mut Dispatcher,
    ) -> (Vec<ActionCompletion>, OutboundMessages) {
        let now = Instant::now();
        let expired_actions: Vec<String> = self
            .actions
            .iter()
            .filter(|(_, a)| a.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();
        let mut settled = Vec::new();
        for id in expired_actions {
            if let Some(pending) = self.actions.remove(&id) {
                settled.push(pending.completion);
                self.timed_out_actions.insert(id);
            }
        }

        let expired_feeds: Vec<FeedIdentity> = self
            .feeds
            .iter()
            .filter(|(_, f)| {
                f.state == ServerFeedState::Opening && f.open_deadline.is_some_and(|d| d <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        let mut outbound = Vec::new();
        for identity in expired_feeds {
            let feed = self.feeds.get_mut(&identity).unwrap();
            feed.state = ServerFeedState::Closed;
            feed.data = None;
            feed.open_deadline = None;
            for handle_id in feed.handles.clone() {
                dispatcher.push(Emission::FeedClose(handle_id, Some(FeedmeError::Timeout)));
            }
            outbound.push(close_message(&identity));
        }
        (settled, outbound)
    }

    /// Drains every in-flight action, delivering `DISCONNECTED` to each. Used
    /// when the session leaves `connected`.
    pub fn fail_all_actions_disconnected(&mut self) -> Vec<ActionCompletion> {
        self.actions
            .drain()
            .map(|(_, pending)| pending.completion)
            .collect()
    }

    /// All handles on feeds that are `open` or `opening`, for the
    /// disconnect-ordering contract (§4.6 rule 1): each receives a
    /// `close(DISCONNECTED)`.
    pub fn handles_to_close_on_disconnect(&mut self) -> Vec<HandleId> {
        let mut ids = Vec::new();
        for feed in self.feeds.values_mut() {
            if matches!(
                feed.state,
                ServerFeedState::Open | ServerFeedState::Opening | ServerFeedState::Closing
            ) {
                feed.state = ServerFeedState::Closed;
                feed.data = None;
                ids.extend(feed.handles.iter().copied());
            }
        }
        ids
    }
}

fn open_message(identity: &FeedIdentity) -> WireMessage {
    WireMessage::FeedOpen(crate::protocol::FeedOpen {
        feed_name: identity.name.clone(),
        feed_args: identity.args.clone(),
    })
}

fn close_message(identity: &FeedIdentity) -> WireMessage {
    WireMessage::FeedClose(crate::protocol::FeedClose {
        feed_name: identity.name.clone(),
        feed_args: identity.args.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> FeedIdentity {
        FeedIdentity::new(name, FeedArgs::new())
    }

    #[test]
    fn desiring_open_twice_fails() {
        let mut reg = Registry::new(3, 0, 0, 0);
        let h = HandleId(0);
        reg.create_handle(h, identity("a"));
        reg.desire_open(h).unwrap();
        assert!(reg.desire_open(h).is_err());
    }

    #[test]
    fn destroy_requires_desired_closed() {
        let mut reg = Registry::new(3, 0, 0, 0);
        let h = HandleId(0);
        reg.create_handle(h, identity("a"));
        reg.desire_open(h).unwrap();
        assert!(reg.destroy(h).is_err());
        reg.desire_closed(h).unwrap();
        reg.destroy(h).unwrap();
    }

    #[test]
    fn destroying_a_handle_while_its_feed_is_still_closing_gcs_once_the_server_responds() {
        let mut reg = Registry::new(3, 0, 0, 0);
        let mut dispatcher = Dispatcher::new();
        let id = identity("a");
        let h = HandleId(0);
        reg.create_handle(h, id.clone());
        reg.desire_open(h).unwrap();
        reg.reconcile(true, &mut dispatcher);
        reg.on_feed_open_response_success(&id, serde_json::json!({}), &mut dispatcher);
        reg.desire_closed(h).unwrap();
        reg.reconcile(true, &mut dispatcher); // feed -> Closing
        reg.destroy(h).unwrap();
        assert_eq!(reg.feed_count(), 1, "feed isn't terminal yet, not collected");

        reg.on_feed_close_response(&id);
        assert_eq!(reg.feed_count(), 0, "settling to Closed must gc the now-handle-less feed");
        assert_eq!(reg.handle_count(), 0, "the destroyed handle record must be dropped too");
    }

    #[test]
    fn reconcile_sends_open_for_new_desire() {
        let mut reg = Registry::new(3, 0, 0, 0);
        let mut dispatcher = Dispatcher::new();
        let h = HandleId(0);
        reg.create_handle(h, identity("a"));
        reg.desire_open(h).unwrap();
        let out = reg.reconcile(true, &mut dispatcher);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], WireMessage::FeedOpen(_)));
        assert!(matches!(dispatcher.pop(), Some(Emission::FeedOpening(_))));
    }

    #[test]
    fn desiring_closed_while_still_opening_suppresses_the_open_event() {
        let mut reg = Registry::new(3, 0, 0, 0);
        let mut dispatcher = Dispatcher::new();
        let id = identity("a");
        let h = HandleId(0);
        reg.create_handle(h, id.clone());
        reg.desire_open(h).unwrap();
        reg.reconcile(true, &mut dispatcher);
        assert!(matches!(dispatcher.pop(), Some(Emission::FeedOpening(_))));
        // The handle changes its mind before the server's FeedOpenResponse
        // arrives; the reconciliation table has no entry for (opening,
        // false), so the server feed stays `opening` and will close once the
        // response lands -- but this handle must never see `Open`.
        reg.desire_closed(h).unwrap();
        reg.on_feed_open_response_success(&id, serde_json::json!({"count": 0}), &mut dispatcher);
        assert!(dispatcher.pop().is_none(), "handle desired closed must not receive Open");
    }

    #[test]
    fn reconcile_without_connection_sends_nothing() {
        let mut reg = Registry::new(3, 0, 0, 0);
        let mut dispatcher = Dispatcher::new();
        let h = HandleId(0);
        reg.create_handle(h, identity("a"));
        reg.desire_open(h).unwrap();
        let out = reg.reconcile(false, &mut dispatcher);
        assert!(out.is_empty());
    }

    #[test]
    fn reopen_limit_zero_never_reopens() {
        let mut reg = Registry::new(0, 0, 0, 0);
        let mut dispatcher = Dispatcher::new();
        let id = identity("a");
        let h = HandleId(0);
        reg.create_handle(h, id.clone());
        reg.desire_open(h).unwrap();
        reg.reconcile(true, &mut dispatcher);
        // Force into terminated without going through the full wire flow.
        reg.feeds.get_mut(&id).unwrap().state = ServerFeedState::Terminated;
        let out = reg.reconcile(true, &mut dispatcher);
        assert!(out.is_empty());
    }

    #[test]
    fn expired_action_settles_timeout_and_later_response_is_discarded() {
        let mut reg = Registry::new(3, 0, 1, 0);
        let mut dispatcher = Dispatcher::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        reg.register_action("cb-1".into(), ActionCompletion::Oneshot(tx));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let (settled, outbound) = reg.expire_deadlines(&mut dispatcher);
        assert_eq!(settled.len(), 1);
        assert!(outbound.is_empty());
        settled.into_iter().next().unwrap().settle(Err(crate::error::FeedmeError::Timeout));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(crate::error::FeedmeError::Timeout)
        ));
        assert!(matches!(reg.take_action("cb-1"), ActionLookup::Expired));
        assert!(matches!(reg.take_action("cb-1"), ActionLookup::Unknown));
    }

    #[test]
    fn expired_feed_open_closes_and_sends_feed_close() {
        let mut reg = Registry::new(3, 0, 0, 1);
        let mut dispatcher = Dispatcher::new();
        let h = HandleId(0);
        reg.create_handle(h, identity("a"));
        reg.desire_open(h).unwrap();
        reg.reconcile(true, &mut dispatcher);
        assert!(matches!(dispatcher.pop(), Some(Emission::FeedOpening(_))));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let (settled, outbound) = reg.expire_deadlines(&mut dispatcher);
        assert!(settled.is_empty());
        assert_eq!(outbound.len(), 1);
        assert!(matches!(outbound[0], WireMessage::FeedClose(_)));
        assert!(matches!(
            dispatcher.pop(),
            Some(Emission::FeedClose(_, Some(crate::error::FeedmeError::Timeout)))
        ));
    }

    #[test]
    fn feed_termination_is_throttled_like_any_other_server_caused_close() {
        let mut reg = Registry::new(0, 0, 0, 0);
        let mut dispatcher = Dispatcher::new();
        let id = identity("a");
        let h = HandleId(0);
        reg.create_handle(h, id.clone());
        reg.desire_open(h).unwrap();
        reg.feeds.get_mut(&id).unwrap().state = ServerFeedState::Open;
        reg.on_feed_termination(&id, &mut dispatcher);
        assert!(matches!(
            dispatcher.pop(),
            Some(Emission::FeedClose(_, Some(crate::error::FeedmeError::Terminated { .. })))
        ));
        // reopenMaxAttempts = 0 means never reopen after a server-caused close.
        let out = reg.reconcile(true, &mut dispatcher);
        assert!(out.is_empty());
    }

    #[test]
    fn action_revelation_hash_mismatch_terminates_and_sends_feed_close() {
        let mut reg = Registry::new(3, 0, 0, 0);
        let mut dispatcher = Dispatcher::new();
        let id = identity("a");
        let h = HandleId(0);
        reg.create_handle(h, id.clone());
        reg.desire_open(h).unwrap();
        let feed = reg.feeds.get_mut(&id).unwrap();
        feed.state = ServerFeedState::Open;
        feed.data = Some(serde_json::json!({"count": 0}));
        let out = reg.on_action_revelation(
            &id,
            "bump".into(),
            serde_json::json!({}),
            Ok(serde_json::json!({"count": 1})),
            Some(Err(())),
            &mut dispatcher,
        );
        assert!(matches!(out, Some(WireMessage::FeedClose(_))));
        assert!(matches!(
            dispatcher.pop(),
            Some(Emission::FeedClose(_, Some(crate::error::FeedmeError::BadActionRevelation(_))))
        ));
        assert_eq!(reg.feeds.get(&id).unwrap().state, ServerFeedState::Terminated);
    }

    #[test]
    fn reopen_limit_permits_up_to_r_then_blocks() {
        let mut reg = Registry::new(1, 0, 0, 0);
        let mut dispatcher = Dispatcher::new();
        let id = identity("a");
        let h = HandleId(0);
        reg.create_handle(h, id.clone());
        reg.desire_open(h).unwrap();
        reg.feeds.get_mut(&id).unwrap().state = ServerFeedState::Terminated;
        let out = reg.reconcile(true, &mut dispatcher);
        assert_eq!(out.len(), 1, "first reopen should be permitted");
        reg.feeds.get_mut(&id).unwrap().state = ServerFeedState::Terminated;
        let out2 = reg.reconcile(true, &mut dispatcher);
        assert!(out2.is_empty(), "second reopen within session lifetime should be blocked");
    }
}
