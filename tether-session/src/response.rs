//! Outbound frame emission.
//!
//! All frames of a connection go through one unbounded [`FrameSink`], so the
//! order frames hit the wire is exactly the order they were emitted. The
//! per-call ordering guarantees fall out of that, with no reordering layer.

use serde::Serialize;
use serde_json::Value;
use tether_schema::Schema;
use tether_wire::codec;
use tether_wire::{CallId, Frame, MessageType, SubFrame};

use crate::errors::{DispatchError, encode_error_body};

/// Sending half of the connection's outbound frame channel. The transport
/// owns the receiving half and writes frames out in order.
#[derive(Clone)]
pub struct FrameSink {
    tx: tokio::sync::mpsc::UnboundedSender<Frame>,
}

impl FrameSink {
    /// Create a sink and the receiver the transport drains.
    pub fn channel() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit one frame. A dropped receiver means the transport is gone; the
    /// frame is discarded, teardown happens via `Dispatcher::close`.
    pub(crate) fn send(&self, frame: Frame) {
        if self.tx.send(frame).is_err() {
            trace!("frame dropped, transport receiver is gone");
        }
    }
}

/// Per-inbound-message reply handle. Every frame it emits is correlated
/// with the inbound message id.
pub struct Response {
    id: CallId,
    sink: FrameSink,
    expose_stack: bool,
}

impl Response {
    pub(crate) fn new(id: CallId, sink: FrameSink, expose_stack: bool) -> Self {
        Self { id, sink, expose_stack }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    /// Encode one frame: the body is projected through `schema` first, so
    /// only declared properties reach the wire.
    pub fn reply(
        &self,
        ty: MessageType,
        schema: &Schema,
        body: &Value,
    ) -> Result<(), DispatchError> {
        let projected = schema.project(body)?;
        let bytes = codec::encode_value(&projected)?;
        self.sink.send(Frame { id: self.id, ty, body: bytes });
        Ok(())
    }

    /// Encode one frame from a fixed-shape body.
    pub fn reply_with<T: Serialize>(&self, ty: MessageType, body: &T) -> Result<(), DispatchError> {
        let bytes = codec::encode(body)?;
        self.sink.send(Frame { id: self.id, ty, body: bytes });
        Ok(())
    }

    /// Begin a batched frame. Sub-frames accumulate in order and are emitted
    /// atomically as one frame on [`CompositeFrame::send`].
    pub fn composite(&self, ty: MessageType) -> CompositeFrame<'_> {
        CompositeFrame { response: self, ty, subs: Vec::new() }
    }

    /// Encode and emit an error frame. Failures to encode the error itself
    /// are logged and swallowed; an error path must not produce another
    /// error to handle.
    pub fn error(&self, err: &DispatchError) {
        match encode_error_body(err, self.expose_stack) {
            Ok(body) => {
                self.sink.send(Frame { id: self.id, ty: MessageType::Error, body });
            }
            Err(encode_err) => {
                warn!(id = self.id, %encode_err, "failed to encode error frame");
            }
        }
    }
}

// Frame emission helpers for code running outside a `Response` borrow:
// subscription callbacks and the collection change batcher hold only a
// sink clone and the call/subscription ids they serve.

/// Emit one schema-projected frame.
pub(crate) fn send_projected(
    sink: &FrameSink,
    id: CallId,
    ty: MessageType,
    schema: &Schema,
    body: &Value,
) -> Result<(), DispatchError> {
    let projected = schema.project(body)?;
    let bytes = codec::encode_value(&projected)?;
    sink.send(Frame { id, ty, body: bytes });
    Ok(())
}

/// Emit one frame with an opaque dynamic body.
pub(crate) fn send_value(
    sink: &FrameSink,
    id: CallId,
    ty: MessageType,
    body: &Value,
) -> Result<(), DispatchError> {
    let bytes = codec::encode_value(body)?;
    sink.send(Frame { id, ty, body: bytes });
    Ok(())
}

/// Emit accumulated sub-frames as one composite frame.
pub(crate) fn send_composite(
    sink: &FrameSink,
    id: CallId,
    ty: MessageType,
    subs: &[SubFrame],
) -> Result<(), DispatchError> {
    let bytes = codec::encode(&subs)?;
    sink.send(Frame { id, ty, body: bytes });
    Ok(())
}

/// A composite frame under construction.
pub struct CompositeFrame<'a> {
    response: &'a Response,
    ty: MessageType,
    subs: Vec<SubFrame>,
}

impl CompositeFrame<'_> {
    /// Append one sub-frame, projecting the body through `schema`.
    pub fn add(
        &mut self,
        ty: MessageType,
        schema: &Schema,
        body: &Value,
    ) -> Result<(), DispatchError> {
        let projected = schema.project(body)?;
        self.subs.push(SubFrame { ty, body: projected });
        Ok(())
    }

    /// Append one sub-frame with an opaque body.
    pub fn add_value(&mut self, ty: MessageType, body: Value) {
        self.subs.push(SubFrame { ty, body });
    }

    /// Emit the accumulated sub-frames as one frame.
    pub fn send(self) -> Result<(), DispatchError> {
        let bytes = codec::encode(&self.subs)?;
        self.response.sink.send(Frame {
            id: self.response.id,
            ty: self.ty,
            body: bytes,
        });
        Ok(())
    }
}
