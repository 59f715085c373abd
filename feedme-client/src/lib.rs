//! Core session, feed-reconciliation, and action-correlation engine for the
//! Feedme client protocol: a bidirectional messaging client that manages a
//! transport-backed session lifecycle, reconciles application-desired feed
//! state against server-reported feed state, correlates in-flight actions
//! with their responses, and applies integrity-checked incremental updates
//! to feed data.
//!
//! Applications supply a [`Transport`] implementation (see
//! `feedme-ws-transport` for a websocket one) and drive the protocol through
//! [`Client`] and the [`FeedHandle`]s it mints.

pub mod client;
pub mod codec;
pub mod config;
pub mod delta;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use client::{Client, ClientEvent, ConnectionState};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{CodecError, ConfigError, DeltaError, FeedmeError, TransportFailure};
pub use feed::{FeedEvent, FeedHandle, FeedState};
pub use protocol::FeedArgs;
pub use transport::{Transport, TransportEvent, TransportState};
