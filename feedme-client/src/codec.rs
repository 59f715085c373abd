//! Wire Codec (§4.2): encode/decode of `WireMessage`s and canonical-JSON MD5
//! integrity checks over feed data trees.

use serde_json::Value;

use crate::error::CodecError;
use crate::protocol::WireMessage;

/// Encodes a message as the canonical outbound frame string.
pub fn encode(msg: &WireMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(|e| CodecError::Json(e.to_string()))
}

/// Decodes an inbound frame string into a `WireMessage`.
///
/// `serde_json::Map` is `BTreeMap`-backed in this crate (the `preserve_order`
/// feature is never enabled), so `serde_json::from_str` already rejects
/// anything that isn't well-formed JSON; schema-level validation of known
/// message shapes happens via `validate_schema` before this is called.
pub fn decode(frame: &str) -> Result<WireMessage, CodecError> {
    serde_json::from_str(frame).map_err(|e| CodecError::Json(e.to_string()))
}

/// Validates a raw inbound frame against the fixed message schema before
/// attempting a typed decode, so a structurally-wrong-but-valid-JSON frame is
/// reported as `INVALID_MESSAGE` rather than a generic serde error.
pub fn validate_schema(frame: &str, compiled: &jsonschema::Validator) -> Result<(), CodecError> {
    let value: Value = serde_json::from_str(frame).map_err(|e| CodecError::Json(e.to_string()))?;
    let errors: Vec<String> = compiled
        .iter_errors(&value)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CodecError::Schema(errors.join("; ")))
    }
}

/// Compiles the fixed message-envelope schema. Only the envelope shape
/// (`MessageType` discriminator plus required-by-kind fields) is enforced
/// here; type-specific deep validation happens through `serde`'s own
/// deserialization once the envelope passes.
pub fn compile_schema() -> jsonschema::Validator {
    let schema = serde_json::json!({
        "type": "object",
        "required": ["MessageType"],
        "properties": {
            "MessageType": {
                "type": "string",
                "enum": [
                    "Handshake", "HandshakeResponse", "Action", "ActionResponse",
                    "FeedOpen", "FeedOpenResponse", "FeedClose", "FeedCloseResponse",
                    "ActionRevelation", "FeedTermination", "ViolationResponse"
                ]
            }
        }
    });
    jsonschema::validator_for(&schema).expect("fixed schema document is always valid")
}

/// Produces the canonical JSON encoding of `value`: lexicographic key order
/// (free, since `Map` is `BTreeMap`-backed without `preserve_order`), no
/// insignificant whitespace, numbers in `serde_json`'s shortest-roundtrip
/// form.
pub fn canonicalize(value: &Value) -> String {
    serde_json::to_string(value).expect("Value serialization is infallible")
}

/// Computes the MD5 digest (lowercase hex) of the canonical encoding of
/// `value`, for comparison against a server-supplied `FeedMd5`.
pub fn md5_hex(value: &Value) -> String {
    let canonical = canonicalize(value);
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_encoding_is_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn md5_matches_for_structurally_equal_trees() {
        let a = json!({"x": [1, 2, 3], "y": "z"});
        let b = json!({"y": "z", "x": [1, 2, 3]});
        assert_eq!(md5_hex(&a), md5_hex(&b));
    }

    #[test]
    fn md5_differs_for_structurally_different_trees() {
        let a = json!({"x": 1});
        let b = json!({"x": 2});
        assert_ne!(md5_hex(&a), md5_hex(&b));
    }

    #[test]
    fn schema_rejects_unknown_message_type() {
        let compiled = compile_schema();
        let err = validate_schema(r#"{"MessageType": "NotReal"}"#, &compiled);
        assert!(err.is_err());
    }

    #[test]
    fn schema_accepts_known_message_type() {
        let compiled = compile_schema();
        validate_schema(r#"{"MessageType": "Handshake", "Versions": ["1"]}"#, &compiled).unwrap();
    }
}
