use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use tether_schema::{PropertyDescriptor, TypeDescriptor, WrapperKind};

use super::*;

fn test_registry() -> ControllerRegistry {
    let mut registry = ControllerRegistry::new();
    registry.register(
        ControllerClass::new("math")
            .action(
                "add",
                vec![
                    PropertyDescriptor::required("a", TypeDescriptor::Int),
                    PropertyDescriptor::required("b", TypeDescriptor::Int),
                ],
                PropertyDescriptor::required("return", TypeDescriptor::Int),
            )
            .action(
                "ticker",
                vec![],
                PropertyDescriptor::required(
                    "return",
                    TypeDescriptor::Wrapper {
                        kind: WrapperKind::PushSource,
                        element: Some(Box::new(TypeDescriptor::String)),
                    },
                ),
            )
            .action(
                "bare_stream",
                vec![],
                PropertyDescriptor::required(
                    "return",
                    TypeDescriptor::Wrapper { kind: WrapperKind::PushSource, element: None },
                ),
            )
            .action(
                "nested",
                vec![],
                PropertyDescriptor::required(
                    "return",
                    TypeDescriptor::Wrapper {
                        kind: WrapperKind::Future,
                        element: Some(Box::new(TypeDescriptor::Wrapper {
                            kind: WrapperKind::PushSource,
                            element: None,
                        })),
                    },
                ),
            ),
    );
    registry
}

// ============================================================================
// Controller registry
// ============================================================================

#[test]
fn controller_class_exposes_declared_actions_and_descriptors() {
    let registry = test_registry();
    let class = registry.get("math").unwrap();

    let mut names: Vec<&str> = class.actions().collect();
    names.sort_unstable();
    assert_eq!(names, ["add", "bare_stream", "nested", "ticker"]);

    let parameters = class.parameters_of("add").unwrap();
    assert_eq!(parameters.len(), 2);
    assert_eq!(parameters[0].name, "a");
    assert_eq!(parameters[1].name, "b");

    let result = class.return_descriptor_of("add").unwrap();
    assert_eq!(result.ty, TypeDescriptor::Int);

    assert!(class.parameters_of("nope").is_none());
    assert!(class.return_descriptor_of("nope").is_none());
}

// ============================================================================
// TypeCache
// ============================================================================

#[test]
fn type_cache_memoizes_per_controller_method() {
    let registry = test_registry();
    let cache = TypeCache::new();

    let first = cache.load(&registry, "math", "add").unwrap();
    let second = cache.load(&registry, "math", "add").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let other = cache.load(&registry, "math", "ticker").unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
}

#[test]
fn type_cache_rejects_unknown_controller_and_action() {
    let registry = test_registry();
    let cache = TypeCache::new();

    let err = cache.load(&registry, "nope", "add").unwrap_err();
    assert!(matches!(err, DispatchError::UnknownController(ref c) if c == "nope"));

    let err = cache.load(&registry, "math", "nope").unwrap_err();
    assert!(matches!(err, DispatchError::UnknownAction { ref method, .. } if method == "nope"));
}

#[test]
fn wrapper_without_element_fails_with_missing_generic() {
    let registry = test_registry();
    let cache = TypeCache::new();

    let err = cache.load(&registry, "math", "bare_stream").unwrap_err();
    match err {
        DispatchError::MissingGeneric { method, wrapper } => {
            assert_eq!(method, "bare_stream");
            assert_eq!(wrapper, WrapperKind::PushSource);
            let rendered = format!("{}", DispatchError::MissingGeneric { method, wrapper });
            assert!(rendered.contains("bare_stream"));
            assert!(rendered.contains("push-source"));
        }
        other => panic!("expected MissingGeneric, got {other:?}"),
    }
}

#[test]
fn nested_wrapper_is_rejected_rather_than_unwrapped_twice() {
    let registry = test_registry();
    let cache = TypeCache::new();

    let err = cache.load(&registry, "math", "nested").unwrap_err();
    assert!(matches!(err, DispatchError::MissingGeneric { .. }));
}

#[test]
fn result_property_is_unwrapped_renamed_and_optional() {
    let registry = test_registry();
    let cache = TypeCache::new();

    let types = cache.load(&registry, "math", "ticker").unwrap();
    assert_eq!(types.result_property.name, "v");
    assert!(types.result_property.optional);
    assert_eq!(types.result_property.ty, TypeDescriptor::String);

    // stream items are `{ id, v }`
    let props = types.stream_item_schema.properties();
    assert_eq!(props.len(), 2);
    assert_eq!(props[0].name, "id");
    assert_eq!(props[1].name, "v");
}

#[test]
fn collection_items_schema_is_built_lazily_and_once() {
    let registry = test_registry();
    let cache = TypeCache::new();

    let types = cache.load(&registry, "math", "ticker").unwrap();
    let first = types.collection_items_schema();
    let second = types.collection_items_schema();
    assert!(std::ptr::eq(first, second));
    assert_eq!(
        types.collection_items_schema().property("v").unwrap().ty,
        TypeDescriptor::Array { element: Box::new(TypeDescriptor::String) },
    );
}

// ============================================================================
// Push sources
// ============================================================================

fn counting_observer(hits: Arc<AtomicUsize>) -> Observer {
    Observer::new(
        move |_value| {
            hits.fetch_add(1, Ordering::SeqCst);
        },
        |_err| {},
        || {},
    )
}

#[test]
fn latched_subject_replays_current_value_on_subscribe() {
    let source = PushSource::latched(json!("hi"));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _guard = source.subscribe(Observer::new(
        move |value| sink.lock().unwrap().push(value),
        |_err| {},
        || {},
    ));
    assert_eq!(*seen.lock().unwrap(), vec![json!("hi")]);

    source.next(json!("again"));
    assert_eq!(*seen.lock().unwrap(), vec![json!("hi"), json!("again")]);
    assert_eq!(source.current_value(), Some(json!("again")));
}

#[test]
fn cancelled_subscription_receives_nothing_further() {
    let source = PushSource::subject();
    let hits = Arc::new(AtomicUsize::new(0));
    let guard = source.subscribe(counting_observer(hits.clone()));

    source.next(json!(1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    guard.cancel();
    source.next(json!(2));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn terminated_source_stops_delivering() {
    let source = PushSource::stream();
    let hits = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));
    let completed = completions.clone();
    let hit_counter = hits.clone();
    let _guard = source.subscribe(Observer::new(
        move |_value| {
            hit_counter.fetch_add(1, Ordering::SeqCst);
        },
        |_err| {},
        move || {
            completed.fetch_add(1, Ordering::SeqCst);
        },
    ));

    source.next(json!(1));
    source.complete();
    source.next(json!(2));
    source.complete();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Live collections
// ============================================================================

#[test]
fn collection_mutations_emit_events_in_order() {
    let collection = LiveCollection::new(json!({}), json!({}), vec![json!("x")]);
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let feed = events.clone();
    let _guard = collection.subscribe_changes(move |event| feed.lock().unwrap().push(event));

    collection.add(vec![json!("y")]);
    collection.remove(vec![json!("x")]);
    collection.set_state(json!({ "page": 2 }));
    collection.replace(vec![json!("z")]);

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            CollectionEvent::Add(vec![json!("y")]),
            CollectionEvent::Remove(vec![json!("x")]),
            CollectionEvent::State(json!({ "page": 2 })),
            CollectionEvent::Set,
        ]
    );
    assert_eq!(collection.all(), vec![json!("z")]);
}

#[test]
fn collection_removes_object_items_by_id() {
    let collection = LiveCollection::new(
        json!({}),
        json!({}),
        vec![json!({ "id": 1, "name": "a" }), json!({ "id": 2, "name": "b" })],
    );
    collection.remove(vec![json!(1)]);
    assert_eq!(collection.all(), vec![json!({ "id": 2, "name": "b" })]);
}

#[test]
fn detached_collection_emits_nothing() {
    let collection = LiveCollection::new(json!({}), json!({}), vec![]);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let _guard = collection.subscribe_changes(move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    collection.unsubscribe();
    collection.add(vec![json!(1)]);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(collection.is_detached());
}
