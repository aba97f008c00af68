#![deny(unsafe_code)]

//! Wire-level types for the tether action dispatcher.
//!
//! A connection exchanges [`Message`]s (inbound) and [`Frame`]s (outbound).
//! Both are envelopes around an opaque MessagePack body; the body is decoded
//! against a schema chosen by the message type. Message type *names* are the
//! protocol identities; the numeric codes a transport assigns to them are
//! its own business.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codec;

/// Call ID assigned by the client, unique within the connection for the
/// duration of the call. All frames of one logical call carry it.
pub type CallId = u64;

/// Client-assigned identifier for one subscription to a stream-result call.
/// Scoped to that call, not to the connection.
pub type SubscriptionId = u64;

/// The closed set of message types.
///
/// Inbound types come first, then the outbound response types. `Composite`
/// frames ([`MessageType::ResponseActionCollection`],
/// [`MessageType::ResponseActionCollectionChange`]) carry an ordered list of
/// [`SubFrame`]s as their body and are delivered atomically.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // ========================================================================
    // Inbound
    // ========================================================================
    /// Type introspection request for a (controller, method) pair.
    ActionType = 0,

    /// Invoke a controller method.
    Action = 1,

    /// Open a client subscription on a stream-result call.
    ActionObservableSubscribe = 2,

    /// Tear down one client subscription.
    ActionObservableUnsubscribe = 3,

    /// Cancel the server-held auto-subscription of a subject result.
    ActionObservableSubjectUnsubscribe = 4,

    /// Tear down a live collection result.
    ResponseActionCollectionUnsubscribe = 5,

    // ========================================================================
    // Outbound
    // ========================================================================
    ResponseActionType = 32,

    /// Single-value result.
    ResponseActionSimple = 33,

    /// Single-value result materialized client-side as a live entity handle.
    /// Wire form is identical to `ResponseActionSimple`; only the tag differs.
    ResponseEntity = 34,

    /// Announces a push-source result and which shape to materialize.
    ResponseActionObservable = 35,

    ResponseActionObservableNext = 36,
    ResponseActionObservableError = 37,
    ResponseActionObservableComplete = 38,

    /// Composite: `[Model, State, Set]`, the opening snapshot of a collection.
    ResponseActionCollection = 39,

    ResponseActionCollectionModel = 40,
    ResponseActionCollectionState = 41,
    ResponseActionCollectionSet = 42,

    /// Composite: one sub-frame per change event, in arrival order.
    ResponseActionCollectionChange = 43,

    ResponseActionCollectionAdd = 44,
    ResponseActionCollectionRemove = 45,

    Error = 63,
}

impl MessageType {
    /// Whether frames of this type carry a `Vec<SubFrame>` body.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            MessageType::ResponseActionCollection | MessageType::ResponseActionCollectionChange
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Inbound envelope. The body is MessagePack, decoded per `ty`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: CallId,
    pub ty: MessageType,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(id: CallId, ty: MessageType, body: Vec<u8>) -> Self {
        Self { id, ty, body }
    }
}

/// Outbound envelope, correlated with the inbound `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: CallId,
    pub ty: MessageType,
    pub body: Vec<u8>,
}

/// One entry of a composite frame body.
///
/// The body is kept as a dynamic value rather than bytes so a composite is
/// encoded in one pass when the outer frame is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubFrame {
    pub ty: MessageType,
    pub body: Value,
}

// ============================================================================
// Fixed body shapes
// ============================================================================

/// Body of an `Action` or `ActionType` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub controller: String,
    pub method: String,
}

/// The push-source shape the client should materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservableKind {
    #[serde(rename = "stream")]
    Stream,
    #[serde(rename = "subject")]
    Subject,
    #[serde(rename = "latched-subject")]
    LatchedSubject,
}

impl std::fmt::Display for ObservableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObservableKind::Stream => "stream",
            ObservableKind::Subject => "subject",
            ObservableKind::LatchedSubject => "latched-subject",
        };
        f.write_str(s)
    }
}

/// Body of a `ResponseActionObservable` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservableAnnouncement {
    #[serde(rename = "type")]
    pub kind: ObservableKind,
}

/// Body of the subscribe/unsubscribe control messages: the client-assigned
/// subscription ID. The envelope `id` is the call ID of the original action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeBody {
    pub id: SubscriptionId,
}

/// Generic error body. `class_type` preserves the error's declared class name
/// so the client can reconstruct a typed error; `stack` is only populated
/// when the dispatcher is configured to expose it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "classType", skip_serializing_if = "Option::is_none", default)]
    pub class_type: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stack: Option<String>,
}

/// One argument-validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailureFrame {
    pub path: String,
    pub code: String,
    pub message: String,
}

/// Error body for failed argument validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrorBody {
    #[serde(rename = "classType")]
    pub class_type: String,
    pub message: String,
    pub errors: Vec<ValidationFailureFrame>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_kind_round_trips_with_wire_names() {
        for (kind, name) in [
            (ObservableKind::Stream, "stream"),
            (ObservableKind::Subject, "subject"),
            (ObservableKind::LatchedSubject, "latched-subject"),
        ] {
            let body = ObservableAnnouncement { kind };
            let bytes = codec::encode(&body).unwrap();
            let value: Value = codec::decode(&bytes).unwrap();
            assert_eq!(value["type"], Value::String(name.into()));
            let back: ObservableAnnouncement = codec::decode(&bytes).unwrap();
            assert_eq!(back, body);
        }
    }

    #[test]
    fn error_body_omits_empty_fields() {
        let body = ErrorBody {
            class_type: None,
            message: "boom".into(),
            stack: None,
        };
        let bytes = codec::encode(&body).unwrap();
        let value: Value = codec::decode(&bytes).unwrap();
        let map = value.as_object().unwrap();
        assert!(!map.contains_key("classType"));
        assert!(!map.contains_key("stack"));
        assert_eq!(map["message"], Value::String("boom".into()));
    }

    #[test]
    fn composite_sub_frames_round_trip() {
        let subs = vec![
            SubFrame {
                ty: MessageType::ResponseActionCollectionAdd,
                body: serde_json::json!({ "v": [1, 2] }),
            },
            SubFrame {
                ty: MessageType::ResponseActionCollectionRemove,
                body: serde_json::json!({ "ids": [7] }),
            },
        ];
        let bytes = codec::encode(&subs).unwrap();
        let back: Vec<SubFrame> = codec::decode(&bytes).unwrap();
        assert_eq!(back, subs);
    }

    #[test]
    fn action_call_decodes_from_dynamic_map() {
        let bytes =
            codec::encode_value(&serde_json::json!({ "controller": "c1", "method": "add" }))
                .unwrap();
        let call: ActionCall = codec::decode(&bytes).unwrap();
        assert_eq!(call.controller, "c1");
        assert_eq!(call.method, "add");
    }
}
