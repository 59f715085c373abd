use serde_json::Value;

/// Every failure surface the core can produce, per the protocol's canonical error kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedmeError {
    #[error("INVALID_ARGUMENT: {0}")]
    InvalidArgument(String),

    #[error("INVALID_STATE: {0}")]
    InvalidState(String),

    #[error("INVALID_FEED_STATE: {0}")]
    InvalidFeedState(String),

    #[error("DESTROYED")]
    Destroyed,

    #[error("DISCONNECTED")]
    Disconnected,

    #[error("TIMEOUT")]
    Timeout,

    #[error("HANDSHAKE_REJECTED")]
    HandshakeRejected,

    #[error("REJECTED: {error_code}")]
    Rejected {
        error_code: String,
        error_data: Value,
    },

    #[error("TERMINATED: {error_code}")]
    Terminated {
        error_code: String,
        error_data: Value,
    },

    #[error("BAD_ACTION_REVELATION: {0}")]
    BadActionRevelation(String),

    #[error("INVALID_MESSAGE: {0}")]
    InvalidMessage(String),

    #[error("UNEXPECTED_MESSAGE: {0}")]
    UnexpectedMessage(String),

    #[error("INVALID_DELTA: {0}")]
    InvalidDelta(String),

    #[error("INVALID_HASH: {0}")]
    InvalidHash(String),

    #[error("transport contract violation: {0}")]
    TransportError(#[from] TransportFailure),
}

/// Raised by the Transport Adapter when the injected transport violates the
/// monotonic state-emission contract described in the transport capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportFailure {
    #[error("UNEXPECTED_EVENT: {0}")]
    UnexpectedEvent(String),

    #[error("BAD_RETURN: {0}")]
    BadReturn(String),

    #[error("THREW_ON_CALL: {0}")]
    ThrewOnCall(String),
}

/// Failure to apply a single delta operation (§4.3). Carried internally; folded
/// into `FeedmeError::InvalidDelta` once surfaced to a handle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeltaError {
    #[error("path does not resolve: {0}")]
    PathNotFound(String),

    #[error("operation {op} incompatible with target type at {path}")]
    TypeMismatch { op: String, path: String },

    #[error("index out of bounds at {path}: {index}")]
    IndexOutOfBounds { path: String, index: i64 },
}

/// Failure to decode or validate an inbound frame (§4.2). Folded into
/// `FeedmeError::InvalidMessage` once surfaced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("schema validation failed: {0}")]
    Schema(String),
}

/// Construction-time validation failure for `ClientConfig`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
