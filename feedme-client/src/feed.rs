//! Public Surface, feed half (§4.7): the `FeedHandle` applications hold.
//!
//! `desired`/`destroyed` are handle-local concepts -- only application code
//! ever mutates them -- so a handle keeps its own cached copy behind a
//! `Mutex` and can answer `INVALID_FEED_STATE`/`DESTROYED` synchronously
//! without a round trip through the client actor, exactly as §4.7 requires
//! for these operations.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::error::FeedmeError;
use crate::registry::{FeedIdentity, HandleId};

/// The server-feed states a handle can observe by folding over its
/// [`FeedEvent`] stream. Not tracked synchronously by `FeedHandle` itself --
/// server-feed state is authoritative only inside the client actor, so
/// querying it is inherently an event-driven, not a polled, operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Opening,
    Open(Value),
    Close(Option<FeedmeError>),
    Action {
        name: String,
        action_data: Value,
        new_data: Value,
        old_data: Value,
    },
}

pub(crate) enum Command {
    DesireOpen(HandleId),
    DesireClosed(HandleId),
    Destroy(HandleId),
    Data(HandleId, oneshot::Sender<Result<Value, FeedmeError>>),
}

struct Local {
    desired_open: bool,
    destroyed: bool,
}

/// A handle to a (possibly shared) server feed. Multiple handles may point
/// at the same identity; they are not deduplicated (§3).
#[derive(Clone)]
pub struct FeedHandle {
    pub(crate) id: HandleId,
    pub(crate) identity: FeedIdentity,
    pub(crate) commands: mpsc::UnboundedSender<crate::client::Command>,
    local: Arc<Mutex<Local>>,
    pub(crate) events: Arc<AsyncMutex<mpsc::UnboundedReceiver<FeedEvent>>>,
}

impl FeedHandle {
    pub(crate) fn new(
        id: HandleId,
        identity: FeedIdentity,
        commands: mpsc::UnboundedSender<crate::client::Command>,
        events: mpsc::UnboundedReceiver<FeedEvent>,
    ) -> Self {
        Self {
            id,
            identity,
            commands,
            local: Arc::new(Mutex::new(Local {
                desired_open: false,
                destroyed: false,
            })),
            events: Arc::new(AsyncMutex::new(events)),
        }
    }

    pub fn feed_name(&self) -> &str {
        &self.identity.name
    }

    pub fn desire_open(&self) -> Result<(), FeedmeError> {
        let mut local = self.local.lock().unwrap();
        if local.destroyed {
            return Err(FeedmeError::Destroyed);
        }
        if local.desired_open {
            return Err(FeedmeError::InvalidFeedState("already desired open".into()));
        }
        local.desired_open = true;
        drop(local);
        let _ = self
            .commands
            .send(crate::client::Command::Feed(Command::DesireOpen(self.id)));
        Ok(())
    }

    pub fn desire_closed(&self) -> Result<(), FeedmeError> {
        let mut local = self.local.lock().unwrap();
        if local.destroyed {
            return Err(FeedmeError::Destroyed);
        }
        if !local.desired_open {
            return Err(FeedmeError::InvalidFeedState("already desired closed".into()));
        }
        local.desired_open = false;
        drop(local);
        let _ = self
            .commands
            .send(crate::client::Command::Feed(Command::DesireClosed(self.id)));
        Ok(())
    }

    pub fn destroy(&self) -> Result<(), FeedmeError> {
        let mut local = self.local.lock().unwrap();
        if local.destroyed {
            return Err(FeedmeError::Destroyed);
        }
        if local.desired_open {
            return Err(FeedmeError::InvalidFeedState(
                "must desire closed before destroy".into(),
            ));
        }
        local.destroyed = true;
        drop(local);
        let _ = self
            .commands
            .send(crate::client::Command::Feed(Command::Destroy(self.id)));
        Ok(())
    }

    pub fn desired_open(&self) -> bool {
        self.local.lock().unwrap().desired_open
    }

    pub fn is_destroyed(&self) -> bool {
        self.local.lock().unwrap().destroyed
    }

    /// Returns the feed's current data tree if its server feed is `open` and
    /// this handle desires it open; otherwise an `INVALID_FEED_STATE`/
    /// `DESTROYED` error. Requires a round trip to the actor since server
    /// feed state is authoritative there.
    pub async fn data(&self) -> Result<Value, FeedmeError> {
        {
            let local = self.local.lock().unwrap();
            if local.destroyed {
                return Err(FeedmeError::Destroyed);
            }
            if !local.desired_open {
                return Err(FeedmeError::InvalidFeedState("not desired open".into()));
            }
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(crate::client::Command::Feed(Command::Data(self.id, tx)))
            .map_err(|_| FeedmeError::Disconnected)?;
        rx.await.map_err(|_| FeedmeError::Disconnected)?
    }

    /// Awaits the next event for this feed. Returns `None` once the client
    /// actor has shut down and no further events will arrive.
    pub async fn next_event(&self) -> Option<FeedEvent> {
        self.events.lock().await.recv().await
    }
}
