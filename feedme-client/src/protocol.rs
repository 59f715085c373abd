//! Wire message shapes exchanged with the Feedme server (§6).
//!
//! Mirrors the discriminated-union convention used for the forwarding
//! protocol's own `WsMessage`: a single externally-tagged enum keyed on
//! `message_type`, with one variant struct per message kind.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type FeedArgs = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "MessageType")]
pub enum WireMessage {
    Handshake(Handshake),
    HandshakeResponse(HandshakeResponse),
    Action(Action),
    ActionResponse(ActionResponse),
    FeedOpen(FeedOpen),
    FeedOpenResponse(FeedOpenResponse),
    FeedClose(FeedClose),
    FeedCloseResponse(FeedCloseResponse),
    ActionRevelation(ActionRevelation),
    FeedTermination(FeedTermination),
    ViolationResponse(ViolationResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Handshake {
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Action {
    pub action_name: String,
    pub action_args: Value,
    pub callback_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, rename_all = "PascalCase")]
pub enum ActionResponse {
    Success {
        callback_id: String,
        success: SuccessMarker,
        action_data: Value,
    },
    Failure {
        callback_id: String,
        success: FailureMarker,
        error_code: String,
        error_data: Value,
    },
}

impl ActionResponse {
    pub fn callback_id(&self) -> &str {
        match self {
            ActionResponse::Success { callback_id, .. } => callback_id,
            ActionResponse::Failure { callback_id, .. } => callback_id,
        }
    }
}

/// Zero-sized marker types so `success: true|false` can discriminate an
/// otherwise-untagged response shape without a manual `Deserialize` impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMarker;
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMarker;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedOpen {
    pub feed_name: String,
    pub feed_args: FeedArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, rename_all = "PascalCase")]
pub enum FeedOpenResponse {
    Success {
        feed_name: String,
        feed_args: FeedArgs,
        success: SuccessMarker,
        feed_data: Value,
    },
    Failure {
        feed_name: String,
        feed_args: FeedArgs,
        success: FailureMarker,
        error_code: String,
        error_data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedClose {
    pub feed_name: String,
    pub feed_args: FeedArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedCloseResponse {
    pub feed_name: String,
    pub feed_args: FeedArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionRevelation {
    pub action_name: String,
    pub action_data: Value,
    pub feed_name: String,
    pub feed_args: FeedArgs,
    pub feed_deltas: Vec<Delta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_md5: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedTermination {
    pub feed_name: String,
    pub feed_args: FeedArgs,
    pub error_code: String,
    pub error_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ViolationResponse {
    pub diagnostics: Value,
}

/// A single delta operation (§4.3). `path` is a sequence of JSON object keys
/// and array indices (encoded as strings; an index parses with
/// `str::parse::<usize>`), walked from the feed data root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Delta {
    pub operation: DeltaOp,
    pub path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DeltaOp {
    Set,
    Delete,
    Insert,
    Push,
    Update,
    Merge,
}
