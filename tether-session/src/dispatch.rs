//! The per-connection dispatcher: routing, invocation, and result branching.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tether_wire::{ActionCall, Message, MessageType, codec};

use crate::collection::open_collection;
use crate::errors::DispatchError;
use crate::registry::{
    ActionGuard, ActionResult, AllowAll, ControllerRegistry, Injector,
};
use crate::response::{FrameSink, Response};
use crate::streams::{ResourceTables, open_stream};
use crate::type_cache::TypeCache;

/// Dispatcher knobs, immutable after construction.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Whether error frames carry stack strings. Off by default so server
    /// internals are not handed to arbitrary peers.
    pub expose_stack: bool,
    /// Connection label used in log output.
    pub label: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { expose_stack: false, label: "tether".into() }
    }
}

/// One dispatcher per connection (or logical session).
///
/// Inbound messages enter through [`Dispatcher::handle`]; every failure is
/// turned into an `Error` frame; nothing escapes to the transport. Outbound
/// frames leave through the [`FrameSink`] in emission order.
pub struct Dispatcher {
    registry: Arc<ControllerRegistry>,
    injector: Arc<dyn Injector>,
    guard: Arc<dyn ActionGuard>,
    types: TypeCache,
    tables: Arc<Mutex<ResourceTables>>,
    sink: FrameSink,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ControllerRegistry>,
        injector: Arc<dyn Injector>,
        sink: FrameSink,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            injector,
            guard: Arc::new(AllowAll),
            types: TypeCache::new(),
            tables: Arc::new(Mutex::new(ResourceTables::default())),
            sink,
            config,
        }
    }

    /// Install an authorization hook. The default allows everything.
    pub fn with_guard(mut self, guard: Arc<dyn ActionGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub(crate) fn tables(&self) -> &Arc<Mutex<ResourceTables>> {
        &self.tables
    }

    pub(crate) fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub(crate) fn expose_stack(&self) -> bool {
        self.config.expose_stack
    }

    /// Handle one inbound message. Action calls go through invocation;
    /// control messages go straight to the resource tables.
    pub async fn handle(&self, message: Message) {
        trace!(label = %self.config.label, id = message.id, ty = %message.ty, "inbound message");
        let response = Response::new(message.id, self.sink.clone(), self.config.expose_stack);
        match message.ty {
            MessageType::Action => {
                if let Err(err) = self.handle_action(&message, &response).await {
                    response.error(&err);
                }
            }
            MessageType::ActionType => {
                if let Err(err) = self.handle_action_types(&message, &response) {
                    response.error(&err);
                }
            }
            MessageType::ActionObservableSubscribe
            | MessageType::ActionObservableUnsubscribe
            | MessageType::ActionObservableSubjectUnsubscribe
            | MessageType::ResponseActionCollectionUnsubscribe => {
                self.handle_control(&message, &response);
            }
            other => {
                response.error(&DispatchError::Control(format!(
                    "unexpected message type {other}"
                )));
            }
        }
    }

    /// Invoke a controller method and marshal its result.
    async fn handle_action(
        &self,
        message: &Message,
        response: &Response,
    ) -> Result<(), DispatchError> {
        let call: ActionCall = codec::decode(&message.body)?;
        let types = self.types.load(&self.registry, &call.controller, &call.method)?;

        // Re-parse the body for the argument properties; `args` sits beside
        // `controller` and `method` in the same map.
        let body = codec::decode_value(&message.body)?;
        let wire_args = body.get("args").cloned().unwrap_or_else(|| json!({}));
        let args = (types.args_decode)(&wire_args)?;

        // Validation rejects before invocation.
        let failures = (types.args_validate)(&args);
        if !failures.is_empty() {
            debug!(
                controller = %call.controller,
                method = %call.method,
                count = failures.len(),
                "argument validation failed"
            );
            return Err(DispatchError::Validation(failures));
        }

        self.guard
            .check(&call.controller, &call.method)
            .map_err(DispatchError::Invocation)?;

        let handle = self
            .registry
            .get(&call.controller)
            .ok_or_else(|| DispatchError::UnknownController(call.controller.clone()))?;
        let instance = self.injector.get(&handle).ok_or_else(|| {
            DispatchError::Invocation(crate::registry::ActionError::new(format!(
                "no instance available for controller '{}'",
                call.controller
            )))
        })?;

        let result = instance
            .call(&call.method, args)
            .await
            .map_err(DispatchError::Invocation)?;

        // Classification order is fixed: entity-subject → collection →
        // push-source → plain. The first matching branch is taken.
        match result {
            ActionResult::Entity(entity) => response.reply(
                MessageType::ResponseEntity,
                &types.result_schema,
                &json!({ "v": entity.into_value() }),
            ),
            ActionResult::Collection(collection) => open_collection(
                &self.tables,
                &self.sink,
                message.id,
                collection,
                &types,
                response,
            ),
            ActionResult::Source(source) => open_stream(
                &self.tables,
                &self.sink,
                self.config.expose_stack,
                message.id,
                source,
                &types,
                response,
            ),
            ActionResult::Value(value) => response.reply(
                MessageType::ResponseActionSimple,
                &types.result_schema,
                &json!({ "v": value }),
            ),
        }
    }

    /// Type introspection: idempotent, no side effects beyond populating the
    /// type cache.
    fn handle_action_types(
        &self,
        message: &Message,
        response: &Response,
    ) -> Result<(), DispatchError> {
        let call: ActionCall = codec::decode(&message.body)?;
        let types = self.types.load(&self.registry, &call.controller, &call.method)?;
        response.reply_with(
            MessageType::ResponseActionType,
            &json!({
                "parameters": &types.parameters,
                "result": &types.result_property,
            }),
        )
    }

    /// Transport teardown: cancel every stream and collection entry this
    /// connection still owns, server-held subject subscriptions included.
    /// Idempotent.
    pub fn close(&self) {
        debug!(label = %self.config.label, "dispatcher closing");
        self.tables.lock().unwrap().close();
    }

    /// Number of live stream and collection entries, for diagnostics.
    pub fn live_entries(&self) -> (usize, usize) {
        let t = self.tables.lock().unwrap();
        (t.streams.len(), t.collections.len())
    }
}
