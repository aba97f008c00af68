//! Live-collection results: one opening snapshot composite, then batched
//! change composites until either side unsubscribes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tether_wire::{CallId, MessageType, SubFrame};

use crate::errors::DispatchError;
use crate::response::{FrameSink, Response, send_composite};
use crate::source::{CollectionEvent, LiveCollection};
use crate::streams::{CollectionEntry, ResourceTables};
use crate::type_cache::ActionTypes;

/// Announce a collection result: emit the opening composite, subscribe the
/// change feed through a batching adapter, and register the teardown entry.
pub(crate) fn open_collection(
    tables: &Arc<Mutex<ResourceTables>>,
    sink: &FrameSink,
    id: CallId,
    collection: LiveCollection,
    types: &ActionTypes,
    response: &Response,
) -> Result<(), DispatchError> {
    let items_schema = types.collection_items_schema().clone();

    // Opening composite: model, state, snapshot, in this order, before any
    // change frame can possibly be emitted.
    let mut opening = response.composite(MessageType::ResponseActionCollection);
    opening.add_value(
        MessageType::ResponseActionCollectionModel,
        collection.model().clone(),
    );
    opening.add_value(MessageType::ResponseActionCollectionState, collection.state());
    opening.add(
        MessageType::ResponseActionCollectionSet,
        &items_schema,
        &json!({ "v": collection.all() }),
    )?;
    opening.send()?;
    debug!(call_id = id, "collection snapshot sent");

    let batcher = Arc::new(ChangeBatcher {
        sink: sink.clone(),
        call_id: id,
        items_schema,
        collection: collection.clone(),
        pending: Mutex::new(Vec::new()),
        scheduled: AtomicBool::new(false),
        dropped: Arc::new(AtomicBool::new(false)),
    });

    let feed_batcher = batcher.clone();
    let feed_guard =
        collection.subscribe_changes(move |event| ChangeBatcher::push(&feed_batcher, event));

    let dropped = batcher.dropped.clone();
    let entry = CollectionEntry::new(move || {
        // Order matters: the drop flag first, so a batch already scheduled
        // is discarded before it can emit.
        dropped.store(true, Ordering::Release);
        drop(feed_guard);
        collection.unsubscribe();
    });

    let mut t = tables.lock().unwrap();
    t.collections.insert(id, entry);
    Ok(())
}

/// Coalesces change events arriving within one cooperative tick into a
/// single composite frame.
///
/// The first event of a tick schedules a flush task; events arriving before
/// that task runs are appended to the same batch. The spawned task runs only
/// after the emitting task yields, which is exactly the tick boundary.
/// Inter-tick batching is not attempted.
struct ChangeBatcher {
    sink: FrameSink,
    call_id: CallId,
    items_schema: tether_schema::Schema,
    collection: LiveCollection,
    pending: Mutex<Vec<CollectionEvent>>,
    scheduled: AtomicBool,
    dropped: Arc<AtomicBool>,
}

impl ChangeBatcher {
    fn push(this: &Arc<Self>, event: CollectionEvent) {
        if this.dropped.load(Ordering::Acquire) {
            return;
        }
        this.pending.lock().unwrap().push(event);
        if !this.scheduled.swap(true, Ordering::AcqRel) {
            let batcher = this.clone();
            tokio::spawn(async move {
                batcher.flush();
            });
        }
    }

    fn flush(&self) {
        // Clear the schedule mark before draining so an event racing in
        // during the flush schedules the next one instead of getting lost.
        self.scheduled.store(false, Ordering::Release);
        let events = std::mem::take(&mut *self.pending.lock().unwrap());
        if events.is_empty() || self.dropped.load(Ordering::Acquire) {
            return;
        }

        let mut subs = Vec::with_capacity(events.len());
        for event in events {
            match self.encode_event(event) {
                Ok(sub) => subs.push(sub),
                Err(e) => {
                    warn!(call_id = self.call_id, %e, "failed to encode collection change");
                }
            }
        }
        if subs.is_empty() {
            return;
        }
        if let Err(e) = send_composite(
            &self.sink,
            self.call_id,
            MessageType::ResponseActionCollectionChange,
            &subs,
        ) {
            warn!(call_id = self.call_id, %e, "failed to emit collection change");
        }
    }

    fn encode_event(&self, event: CollectionEvent) -> Result<SubFrame, DispatchError> {
        let sub = match event {
            CollectionEvent::Add(items) => SubFrame {
                ty: MessageType::ResponseActionCollectionAdd,
                body: self.items_schema.project(&json!({ "v": items }))?,
            },
            CollectionEvent::Remove(ids) => SubFrame {
                ty: MessageType::ResponseActionCollectionRemove,
                body: json!({ "ids": ids }),
            },
            // Full resnap, taken at emit time: the set's contents at event
            // time are already stale by now.
            CollectionEvent::Set => SubFrame {
                ty: MessageType::ResponseActionCollectionSet,
                body: self.items_schema.project(&json!({ "v": self.collection.all() }))?,
            },
            CollectionEvent::State(state) => SubFrame {
                ty: MessageType::ResponseActionCollectionState,
                body: state,
            },
        };
        Ok(sub)
    }
}
