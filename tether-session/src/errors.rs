//! Failure kinds surfaced while handling a message, and their wire encoding.

use serde_json::Value;
use tether_schema::{SchemaError, ValidationFailure, WrapperKind};
use tether_wire::codec::{self, DecodeError, EncodeError};
use tether_wire::{ErrorBody, ValidationErrorBody, ValidationFailureFrame};

use crate::registry::ActionError;

#[derive(Debug)]
pub enum DispatchError {
    /// No controller registered under the requested path.
    UnknownController(String),
    /// The controller exists but declares no such action.
    UnknownAction { controller: String, method: String },
    /// The declared return type is a wrapper without an element type.
    MissingGeneric { method: String, wrapper: WrapperKind },
    /// Arguments failed validation; the method was never invoked.
    Validation(Vec<ValidationFailure>),
    /// The method body failed (threw or rejected).
    Invocation(ActionError),
    /// A subscribe/unsubscribe control request could not be honored.
    Control(String),
    /// The inbound body could not be decoded.
    Decode(DecodeError),
    /// An outbound body could not be encoded.
    Encode(EncodeError),
    /// A body did not match its schema.
    Schema(SchemaError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::UnknownController(id) => {
                write!(f, "unknown controller '{id}'")
            }
            DispatchError::UnknownAction { controller, method } => {
                write!(f, "controller '{controller}' has no action '{method}'")
            }
            DispatchError::MissingGeneric { method, wrapper } => {
                write!(
                    f,
                    "action '{method}' returns a {wrapper} without a declared element type"
                )
            }
            DispatchError::Validation(failures) => {
                write!(f, "validation failed ({} error(s))", failures.len())
            }
            DispatchError::Invocation(err) => write!(f, "{err}"),
            DispatchError::Control(msg) => f.write_str(msg),
            DispatchError::Decode(e) => write!(f, "{e}"),
            DispatchError::Encode(e) => write!(f, "{e}"),
            DispatchError::Schema(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<DecodeError> for DispatchError {
    fn from(e: DecodeError) -> Self {
        DispatchError::Decode(e)
    }
}

impl From<EncodeError> for DispatchError {
    fn from(e: EncodeError) -> Self {
        DispatchError::Encode(e)
    }
}

impl From<SchemaError> for DispatchError {
    fn from(e: SchemaError) -> Self {
        DispatchError::Schema(e)
    }
}

/// Encode a failure as the body of an `Error` frame.
///
/// Validation failures keep their list shape; everything else collapses to
/// `{ classType?, message, stack? }`. Stacks are only exposed when the
/// dispatcher is configured for it.
pub(crate) fn encode_error_body(
    err: &DispatchError,
    expose_stack: bool,
) -> Result<Vec<u8>, EncodeError> {
    match err {
        DispatchError::Validation(failures) => codec::encode(&ValidationErrorBody {
            class_type: "ValidationError".into(),
            message: err.to_string(),
            errors: failures
                .iter()
                .map(|failure| ValidationFailureFrame {
                    path: failure.path.clone(),
                    code: failure.code.clone(),
                    message: failure.message.clone(),
                })
                .collect(),
        }),
        DispatchError::Invocation(action_err) => codec::encode(&ErrorBody {
            class_type: action_err.class_type.clone(),
            message: action_err.message.clone(),
            stack: if expose_stack { action_err.stack.clone() } else { None },
        }),
        other => codec::encode(&ErrorBody {
            class_type: None,
            message: other.to_string(),
            stack: None,
        }),
    }
}

/// Body of a `ResponseActionObservableError` frame: the subscription (or
/// call) id plus the error fields, delivered on the stream's own channel.
pub(crate) fn stream_error_body(id: u64, err: &ActionError, expose_stack: bool) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("id".into(), id.into());
    if let Some(class) = &err.class_type {
        body.insert("classType".into(), class.clone().into());
    }
    body.insert("message".into(), err.message.clone().into());
    if expose_stack && let Some(stack) = &err.stack {
        body.insert("stack".into(), stack.clone().into());
    }
    Value::Object(body)
}
