//! Deferred Dispatcher (§4.6): a plain FIFO queue of externally-visible
//! effects, drained to quiescence after every trigger. Draining may itself
//! push new emissions (e.g. delivering a `close` event might release a
//! handle that schedules a follow-up), which are appended to the same queue
//! and drained within the same tick -- satisfying ordering rule 3.

use std::collections::VecDeque;

use serde_json::Value;

use crate::error::FeedmeError;
use crate::registry::HandleId;

/// The single-settlement continuation for an action request (§4.5, §9): the
/// public surface exposes a callback form and a future form, but both
/// resolve through this one enum so a late server response after settlement
/// is just a removed-from-map no-op.
pub enum ActionCompletion {
    Callback(Box<dyn FnOnce(Result<Value, FeedmeError>) + Send>),
    Oneshot(tokio::sync::oneshot::Sender<Result<Value, FeedmeError>>),
}

impl ActionCompletion {
    pub fn settle(self, result: Result<Value, FeedmeError>) {
        match self {
            ActionCompletion::Callback(cb) => cb(result),
            ActionCompletion::Oneshot(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

pub enum Emission {
    FeedOpening(HandleId),
    FeedOpen(HandleId, Value),
    FeedClose(HandleId, Option<FeedmeError>),
    /// `(action_name, action_data, new_feed_data, old_feed_data)` delivered
    /// to a handle desired open on the feed the revelation applies to.
    ActionRevealed(HandleId, String, Value, Value, Value),
    ClientEvent(crate::client::ClientEvent),
}

pub struct Dispatcher {
    queue: VecDeque<Emission>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, emission: Emission) {
        self.queue.push_back(emission);
    }

    /// Pops the next emission, if any. The client actor calls this in a loop
    /// until it returns `None`, delivering each to its destination (feed
    /// event channel, action completion, client event broadcast) -- new
    /// pushes made during delivery are picked up by later iterations of that
    /// same loop, which is what keeps rule 3 of §4.6 honest.
    pub fn pop(&mut self) -> Option<Emission> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_ordering_preserved() {
        let mut d = Dispatcher::new();
        d.push(Emission::FeedOpening(HandleId(1)));
        d.push(Emission::FeedOpening(HandleId(2)));
        match d.pop().unwrap() {
            Emission::FeedOpening(id) => assert_eq!(id, HandleId(1)),
            _ => panic!("wrong variant"),
        }
        match d.pop().unwrap() {
            Emission::FeedOpening(id) => assert_eq!(id, HandleId(2)),
            _ => panic!("wrong variant"),
        }
        assert!(d.pop().is_none());
    }

    #[test]
    fn pushing_during_drain_is_observed_in_same_pass() {
        let mut d = Dispatcher::new();
        d.push(Emission::FeedOpening(HandleId(1)));
        let mut delivered = Vec::new();
        while let Some(emission) = d.pop() {
            if let Emission::FeedOpening(id) = emission {
                delivered.push(id);
                if id == HandleId(1) {
                    d.push(Emission::FeedOpening(HandleId(2)));
                }
            }
        }
        assert_eq!(delivered, vec![HandleId(1), HandleId(2)]);
    }
}
