//! Per-call resource tables for long-lived results, and the observer wiring
//! that forwards push-source values onto the wire.
//!
//! Two independent tables keyed by call ID, one for push sources, one for
//! live collections. A call ID never appears in both: the result of a call
//! has exactly one shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tether_schema::Schema;
use tether_wire::{CallId, MessageType, ObservableAnnouncement, SubscriptionId};

use crate::errors::{DispatchError, stream_error_body};
use crate::response::{FrameSink, Response, send_projected, send_value};
use crate::source::{Observer, PushSource, SourceSubscription};
use crate::type_cache::ActionTypes;

/// One live subscription: the forwarding gate and the source-side guard.
///
/// The `active` flag is load-bearing: a value already in flight when the
/// client unsubscribes must not be forwarded, even though the source-side
/// teardown has not finished yet. Every callback checks it first.
pub(crate) struct StreamSubscription {
    pub active: Arc<AtomicBool>,
    #[allow(dead_code)] // held for its Drop: cancels the source subscription
    pub guard: SourceSubscription,
}

impl StreamSubscription {
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// State of one push-source result.
pub(crate) struct StreamEntry {
    pub source: PushSource,
    pub item_schema: Schema,
    pub subscriptions: HashMap<SubscriptionId, StreamSubscription>,
    /// Server-held auto-subscription, present for subject variants.
    pub auto: Option<StreamSubscription>,
}

/// State of one live-collection result: a teardown closure that flips the
/// batcher's drop flag, cancels the change feed, and unsubscribes the
/// collection itself. Runs at most once, on unsubscribe or connection close.
pub(crate) struct CollectionEntry {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CollectionEntry {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }
}

impl Drop for CollectionEntry {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[derive(Default)]
pub(crate) struct ResourceTables {
    pub streams: HashMap<CallId, StreamEntry>,
    pub collections: HashMap<CallId, CollectionEntry>,
}

impl ResourceTables {
    /// Transport teardown: cancel every entry the connection still owns,
    /// including server-held subject auto-subscriptions.
    pub fn close(&mut self) {
        for (id, entry) in self.streams.drain() {
            trace!(call_id = id, "closing stream entry");
            for sub in entry.subscriptions.values() {
                sub.deactivate();
            }
            if let Some(auto) = &entry.auto {
                auto.deactivate();
            }
            // guards cancel on drop
        }
        for (id, _entry) in self.collections.drain() {
            trace!(call_id = id, "closing collection entry");
            // entry cancels on drop
        }
    }
}

/// Announce a push-source result and register its entry.
///
/// The announcement frame goes out before the auto-subscription is opened:
/// a latched subject replays its current value synchronously on subscribe,
/// and that replay must never precede the announcement.
pub(crate) fn open_stream(
    tables: &Arc<Mutex<ResourceTables>>,
    sink: &FrameSink,
    expose_stack: bool,
    id: CallId,
    source: PushSource,
    types: &ActionTypes,
    response: &Response,
) -> Result<(), DispatchError> {
    let kind = source.kind();
    {
        let mut t = tables.lock().unwrap();
        t.streams.insert(
            id,
            StreamEntry {
                source: source.clone(),
                item_schema: types.stream_item_schema.clone(),
                subscriptions: HashMap::new(),
                auto: None,
            },
        );
    }
    debug!(call_id = id, %kind, "push source registered");
    response.reply_with(
        MessageType::ResponseActionObservable,
        &ObservableAnnouncement { kind },
    )?;

    if source.is_subject() {
        let active = Arc::new(AtomicBool::new(true));
        let observer = forwarding_observer(
            sink.clone(),
            id,
            id, // subject values correlate by call ID, not subscription ID
            types.stream_item_schema.clone(),
            active.clone(),
            Arc::downgrade(tables),
            expose_stack,
        );
        let guard = source.subscribe(observer);
        let mut t = tables.lock().unwrap();
        if let Some(entry) = t.streams.get_mut(&id) {
            entry.auto = Some(StreamSubscription { active, guard });
        }
        // else: the subject terminated during the synchronous replay and the
        // entry is already gone; dropping the guard cancels cleanly.
    }
    Ok(())
}

/// Build the observer that forwards one subscription onto the wire.
///
/// `forward_id` is the `id` carried in item bodies: the subscription ID for
/// client subscriptions, the call ID for the server's subject subscription.
/// Termination (complete or error) destroys the whole stream entry.
pub(crate) fn forwarding_observer(
    sink: FrameSink,
    call_id: CallId,
    forward_id: u64,
    item_schema: Schema,
    active: Arc<AtomicBool>,
    tables: Weak<Mutex<ResourceTables>>,
    expose_stack: bool,
) -> Observer {
    let next_sink = sink.clone();
    let next_active = active.clone();
    let next_schema = item_schema;
    let error_sink = sink.clone();
    let error_active = active.clone();
    let error_tables = tables.clone();
    let complete_sink = sink;
    let complete_active = active;
    let complete_tables = tables;

    Observer::new(
        move |value| {
            if !next_active.load(Ordering::Acquire) {
                return;
            }
            let body = serde_json::json!({ "id": forward_id, "v": value });
            if let Err(e) = send_projected(
                &next_sink,
                call_id,
                MessageType::ResponseActionObservableNext,
                &next_schema,
                &body,
            ) {
                warn!(call_id, %e, "failed to encode stream item");
            }
        },
        move |err| {
            if !error_active.swap(false, Ordering::AcqRel) {
                return;
            }
            let body = stream_error_body(forward_id, &err, expose_stack);
            let _ = send_value(
                &error_sink,
                call_id,
                MessageType::ResponseActionObservableError,
                &body,
            );
            drop_stream_entry(&error_tables, call_id);
        },
        move || {
            if !complete_active.swap(false, Ordering::AcqRel) {
                return;
            }
            let body = serde_json::json!({ "id": forward_id });
            let _ = send_value(
                &complete_sink,
                call_id,
                MessageType::ResponseActionObservableComplete,
                &body,
            );
            drop_stream_entry(&complete_tables, call_id);
        },
    )
}

// Terminal callbacks destroy the entry but leave the sibling subscriptions'
// `active` flags alone: the source delivers the terminal event to every
// observer, and each one still owes its own Complete/Error frame.
fn drop_stream_entry(tables: &Weak<Mutex<ResourceTables>>, call_id: CallId) {
    if let Some(tables) = tables.upgrade() {
        tables.lock().unwrap().streams.remove(&call_id);
    }
}
