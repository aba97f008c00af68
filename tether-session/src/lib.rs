#![deny(unsafe_code)]

//! Per-connection action dispatcher.
//!
//! One [`Dispatcher`] lives per connection (or logical session). It receives
//! decoded [`tether_wire::Message`] envelopes, routes action calls through
//! the memoized [`TypeCache`], invokes the target controller method, and
//! marshals the result back as one or more [`tether_wire::Frame`]s:
//!
//! - a plain value (or entity handle) completes with a single frame,
//! - a push source is announced and then streamed per client subscription,
//! - a live collection is snapshotted once and then diff-streamed until
//!   either side unsubscribes.
//!
//! Subscribe/unsubscribe control messages bypass invocation entirely and
//! operate on the per-call resource tables. On transport close,
//! [`Dispatcher::close`] cancels everything the connection still owns.

#[macro_use]
mod macros;

mod collection;
mod control;
mod dispatch;
mod errors;
mod registry;
mod response;
mod source;
mod streams;
mod type_cache;

pub use dispatch::{Dispatcher, DispatcherConfig};
pub use errors::DispatchError;
pub use registry::{
    ActionError, ActionGuard, ActionResult, AllowAll, BoxFuture, Controller, ControllerClass,
    ControllerHandle, ControllerRegistry, Injector, MapInjector,
};
pub use response::{CompositeFrame, FrameSink, Response};
pub use source::{
    ChangeFeedGuard, CollectionEvent, EntitySubject, LiveCollection, Observer, PushSource,
    SourceSubscription,
};
pub use type_cache::{ActionTypes, TypeCache};

#[cfg(test)]
mod tests;
