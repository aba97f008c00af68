//! Result shapes that outlive the call that produced them: push sources
//! (stream / subject / latched subject), live collections, and the
//! single-value entity handle.
//!
//! Emission never invokes observer callbacks while holding the source's own
//! lock: callbacks are snapshotted under the lock and run after it is
//! released, so an observer may cancel subscriptions or touch dispatcher
//! state without deadlocking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tether_wire::ObservableKind;

use crate::registry::ActionError;

// ============================================================================
// Push sources
// ============================================================================

/// Callbacks for one subscription to a [`PushSource`].
pub struct Observer {
    on_next: Box<dyn Fn(Value) + Send + Sync>,
    on_error: Box<dyn Fn(ActionError) + Send + Sync>,
    on_complete: Box<dyn Fn() + Send + Sync>,
}

impl Observer {
    pub fn new(
        on_next: impl Fn(Value) + Send + Sync + 'static,
        on_error: impl Fn(ActionError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error: Box::new(on_error),
            on_complete: Box::new(on_complete),
        }
    }
}

struct SourceInner {
    next_key: u64,
    observers: HashMap<u64, Arc<Observer>>,
    /// Latched variant only: the value replayed on subscribe.
    current: Option<Value>,
    terminated: bool,
}

struct SourceCore {
    kind: ObservableKind,
    inner: Mutex<SourceInner>,
}

/// A push source: delivers zero or more values over time, then terminates
/// with completion or error. Cloning shares the underlying source.
///
/// Three variants:
/// - `stream` is subscribed only on client request,
/// - `subject` is multicast; the dispatcher auto-subscribes at call time,
/// - `latched subject` additionally holds a current value and replays it
///   synchronously to every new subscriber.
#[derive(Clone)]
pub struct PushSource {
    core: Arc<SourceCore>,
}

impl PushSource {
    fn with_kind(kind: ObservableKind, current: Option<Value>) -> Self {
        Self {
            core: Arc::new(SourceCore {
                kind,
                inner: Mutex::new(SourceInner {
                    next_key: 0,
                    observers: HashMap::new(),
                    current,
                    terminated: false,
                }),
            }),
        }
    }

    pub fn stream() -> Self {
        Self::with_kind(ObservableKind::Stream, None)
    }

    pub fn subject() -> Self {
        Self::with_kind(ObservableKind::Subject, None)
    }

    pub fn latched(initial: Value) -> Self {
        Self::with_kind(ObservableKind::LatchedSubject, Some(initial))
    }

    pub fn kind(&self) -> ObservableKind {
        self.core.kind
    }

    /// Whether the dispatcher auto-subscribes at call time.
    pub fn is_subject(&self) -> bool {
        matches!(
            self.core.kind,
            ObservableKind::Subject | ObservableKind::LatchedSubject
        )
    }

    /// The latched variant's current value.
    pub fn current_value(&self) -> Option<Value> {
        self.core.inner.lock().unwrap().current.clone()
    }

    /// Register an observer. A latched subject replays its current value to
    /// the new observer before this returns. The returned guard cancels the
    /// subscription when dropped.
    pub fn subscribe(&self, observer: Observer) -> SourceSubscription {
        let observer = Arc::new(observer);
        let (key, replay) = {
            let mut inner = self.core.inner.lock().unwrap();
            let key = inner.next_key;
            inner.next_key += 1;
            if !inner.terminated {
                inner.observers.insert(key, observer.clone());
            }
            (key, inner.current.clone())
        };
        if let Some(value) = replay {
            (observer.on_next)(value);
        }
        SourceSubscription { core: Arc::downgrade(&self.core), key }
    }

    fn live_observers(&self) -> Vec<Arc<Observer>> {
        self.core.inner.lock().unwrap().observers.values().cloned().collect()
    }

    /// Deliver one value to every observer.
    pub fn next(&self, value: Value) {
        {
            let mut inner = self.core.inner.lock().unwrap();
            if inner.terminated {
                return;
            }
            if inner.current.is_some() {
                inner.current = Some(value.clone());
            }
        }
        for observer in self.live_observers() {
            (observer.on_next)(value.clone());
        }
    }

    /// Terminate the source with an error. Observers are dropped afterwards;
    /// late subscribers see nothing.
    pub fn error(&self, err: ActionError) {
        let observers = self.take_observers();
        for observer in observers {
            (observer.on_error)(err.clone());
        }
    }

    /// Terminate the source normally.
    pub fn complete(&self) {
        let observers = self.take_observers();
        for observer in observers {
            (observer.on_complete)();
        }
    }

    fn take_observers(&self) -> Vec<Arc<Observer>> {
        let mut inner = self.core.inner.lock().unwrap();
        if inner.terminated {
            return Vec::new();
        }
        inner.terminated = true;
        inner.observers.drain().map(|(_, o)| o).collect()
    }
}

/// Cancellation guard for one push-source subscription. Dropping it removes
/// the observer; values emitted afterwards are no longer delivered to it.
pub struct SourceSubscription {
    core: Weak<SourceCore>,
    key: u64,
}

impl SourceSubscription {
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for SourceSubscription {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.inner.lock().unwrap().observers.remove(&self.key);
        }
    }
}

// ============================================================================
// Entity subject
// ============================================================================

/// Single-value live handle to a domain entity. On the wire it looks exactly
/// like a plain value; only the frame tag differs, which is what makes the
/// client materialize it as a live handle.
pub struct EntitySubject {
    value: Value,
}

impl EntitySubject {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

// ============================================================================
// Live collections
// ============================================================================

/// A change observed on a [`LiveCollection`].
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    /// Items were added.
    Add(Vec<Value>),
    /// Items were removed, identified by their ids.
    Remove(Vec<Value>),
    /// The item set was replaced wholesale; consumers re-snapshot via
    /// [`LiveCollection::all`] at emission time, not at event time.
    Set,
    /// The query state changed.
    State(Value),
}

struct CollectionInner {
    state: Value,
    items: Vec<Value>,
    feeds: HashMap<u64, Arc<dyn Fn(CollectionEvent) + Send + Sync>>,
    next_key: u64,
    detached: bool,
}

struct CollectionCore {
    model: Value,
    inner: Mutex<CollectionInner>,
}

/// An observable live set of items with a query model, a state, a snapshot,
/// and a change event feed. Cloning shares the underlying collection.
#[derive(Clone)]
pub struct LiveCollection {
    core: Arc<CollectionCore>,
}

impl LiveCollection {
    pub fn new(model: Value, state: Value, items: Vec<Value>) -> Self {
        Self {
            core: Arc::new(CollectionCore {
                model,
                inner: Mutex::new(CollectionInner {
                    state,
                    items,
                    feeds: HashMap::new(),
                    next_key: 0,
                    detached: false,
                }),
            }),
        }
    }

    pub fn model(&self) -> &Value {
        &self.core.model
    }

    pub fn state(&self) -> Value {
        self.core.inner.lock().unwrap().state.clone()
    }

    /// Snapshot of the current items.
    pub fn all(&self) -> Vec<Value> {
        self.core.inner.lock().unwrap().items.clone()
    }

    /// Observe change events. The guard cancels the feed when dropped.
    pub fn subscribe_changes(
        &self,
        feed: impl Fn(CollectionEvent) + Send + Sync + 'static,
    ) -> ChangeFeedGuard {
        let mut inner = self.core.inner.lock().unwrap();
        let key = inner.next_key;
        inner.next_key += 1;
        if !inner.detached {
            inner.feeds.insert(key, Arc::new(feed));
        }
        ChangeFeedGuard { core: Arc::downgrade(&self.core), key }
    }

    fn emit(&self, event: CollectionEvent) {
        let feeds: Vec<_> = {
            let inner = self.core.inner.lock().unwrap();
            if inner.detached {
                return;
            }
            inner.feeds.values().cloned().collect()
        };
        for feed in feeds {
            feed(event.clone());
        }
    }

    /// Append items and emit an `Add` event.
    pub fn add(&self, items: Vec<Value>) {
        {
            let mut inner = self.core.inner.lock().unwrap();
            inner.items.extend(items.iter().cloned());
        }
        self.emit(CollectionEvent::Add(items));
    }

    /// Remove items by id and emit a `Remove` event. Items are matched on
    /// their `id` property, or on whole-value equality for scalar items.
    pub fn remove(&self, ids: Vec<Value>) {
        {
            let mut inner = self.core.inner.lock().unwrap();
            inner.items.retain(|item| {
                let key = item.get("id").unwrap_or(item);
                !ids.contains(key)
            });
        }
        self.emit(CollectionEvent::Remove(ids));
    }

    /// Replace the item set and emit a `Set` event.
    pub fn replace(&self, items: Vec<Value>) {
        {
            let mut inner = self.core.inner.lock().unwrap();
            inner.items = items;
        }
        self.emit(CollectionEvent::Set);
    }

    /// Update the query state and emit a `State` event.
    pub fn set_state(&self, state: Value) {
        {
            let mut inner = self.core.inner.lock().unwrap();
            inner.state = state.clone();
        }
        self.emit(CollectionEvent::State(state));
    }

    /// Detach the collection: the change feed is cleared and further
    /// mutations emit nothing. Called when the consuming side unsubscribes.
    pub fn unsubscribe(&self) {
        let mut inner = self.core.inner.lock().unwrap();
        inner.detached = true;
        inner.feeds.clear();
    }

    pub fn is_detached(&self) -> bool {
        self.core.inner.lock().unwrap().detached
    }
}

/// Cancellation guard for one change feed subscription.
pub struct ChangeFeedGuard {
    core: Weak<CollectionCore>,
    key: u64,
}

impl ChangeFeedGuard {
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for ChangeFeedGuard {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.inner.lock().unwrap().feeds.remove(&self.key);
        }
    }
}
