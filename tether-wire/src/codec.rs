//! MessagePack encoding of message bodies.
//!
//! Bodies are maps keyed by property name (`to_vec_named`), so schema
//! evolution keeps decodability: unknown keys are skipped, missing optional
//! keys decode as absent. Dynamic values use [`serde_json::Value`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug)]
pub enum EncodeError {
    Encode(rmp_serde::encode::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug)]
pub enum DecodeError {
    Decode(rmp_serde::decode::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode any serializable body, struct fields as named map entries.
pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, EncodeError> {
    rmp_serde::encode::to_vec_named(body).map_err(EncodeError::Encode)
}

/// Encode a dynamic value.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, EncodeError> {
    encode(value)
}

/// Decode a body into any deserializable shape.
pub fn decode<'a, T: Deserialize<'a>>(buf: &'a [u8]) -> Result<T, DecodeError> {
    rmp_serde::decode::from_slice(buf).map_err(DecodeError::Decode)
}

/// Decode a body into a dynamic value.
pub fn decode_value(buf: &[u8]) -> Result<Value, DecodeError> {
    decode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_round_trip() {
        let v = json!({
            "id": 7,
            "v": { "name": "x", "tags": ["a", "b"], "score": 1.5, "ok": true },
        });
        let bytes = encode_value(&v).unwrap();
        assert_eq!(decode_value(&bytes).unwrap(), v);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let bytes = encode_value(&json!({ "a": 1 })).unwrap();
        assert!(decode_value(&bytes[..bytes.len() - 1]).is_err());
    }
}
