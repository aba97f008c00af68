//! Controller declarations and the interfaces the dispatcher consumes to
//! reach application code: the controller registry, the injector, and the
//! authorization hook.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tether_schema::PropertyDescriptor;

use crate::source::{EntitySubject, LiveCollection, PushSource};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An application-level failure raised by a controller method.
///
/// `class_type` preserves the declared error class name so the peer can
/// rebuild a typed error; `stack` is forwarded to the wire only when the
/// dispatcher is configured to expose it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionError {
    pub class_type: Option<String>,
    pub message: String,
    pub stack: Option<String>,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { class_type: None, message: message.into(), stack: None }
    }

    pub fn typed(class_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_type: Some(class_type.into()),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.class_type {
            Some(class) => write!(f, "{class}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ActionError {}

/// What a controller method produced, already awaited.
///
/// Classification is by variant, checked in the fixed order entity-subject →
/// collection → push-source → plain; the dispatcher branches on the first
/// match.
pub enum ActionResult {
    /// Single live-entity handle; wire form equals a plain value, only the
    /// frame tag differs.
    Entity(EntitySubject),
    /// A live collection the dispatcher snapshots and then diff-streams.
    Collection(LiveCollection),
    /// A push source the client may subscribe to.
    Source(PushSource),
    /// A plain value.
    Value(Value),
}

/// A controller instance. The dispatcher calls methods by name with
/// positional arguments in declaration order; the returned future is awaited
/// before classification.
pub trait Controller: Send + Sync + 'static {
    fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<ActionResult, ActionError>>;
}

/// Declared signature of one action: parameter descriptors in declaration
/// order plus the (possibly wrapped) return descriptor.
#[derive(Debug, Clone, PartialEq)]
struct ActionSignature {
    parameters: Vec<PropertyDescriptor>,
    result: PropertyDescriptor,
}

/// The declared shape of a registered controller.
#[derive(Debug, Clone)]
pub struct ControllerClass {
    id: String,
    actions: HashMap<String, ActionSignature>,
}

pub type ControllerHandle = Arc<ControllerClass>;

impl ControllerClass {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), actions: HashMap::new() }
    }

    pub fn action(
        mut self,
        name: impl Into<String>,
        parameters: Vec<PropertyDescriptor>,
        result: PropertyDescriptor,
    ) -> Self {
        self.actions.insert(name.into(), ActionSignature { parameters, result });
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The declared action names.
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn parameters_of(&self, method: &str) -> Option<&[PropertyDescriptor]> {
        self.actions.get(method).map(|s| s.parameters.as_slice())
    }

    pub fn return_descriptor_of(&self, method: &str) -> Option<&PropertyDescriptor> {
        self.actions.get(method).map(|s| &s.result)
    }
}

/// Registry of controller classes, keyed by controller path.
#[derive(Default)]
pub struct ControllerRegistry {
    classes: HashMap<String, ControllerHandle>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ControllerClass) {
        self.classes.insert(class.id.clone(), Arc::new(class));
    }

    pub fn get(&self, id: &str) -> Option<ControllerHandle> {
        self.classes.get(id).cloned()
    }
}

/// Resolves controller instances for registered classes.
pub trait Injector: Send + Sync + 'static {
    fn get(&self, handle: &ControllerHandle) -> Option<Arc<dyn Controller>>;
}

/// Injector backed by a plain map of pre-built instances.
#[derive(Default)]
pub struct MapInjector {
    instances: HashMap<String, Arc<dyn Controller>>,
}

impl MapInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide(&mut self, controller: impl Into<String>, instance: Arc<dyn Controller>) {
        self.instances.insert(controller.into(), instance);
    }
}

impl Injector for MapInjector {
    fn get(&self, handle: &ControllerHandle) -> Option<Arc<dyn Controller>> {
        self.instances.get(handle.id()).cloned()
    }
}

/// Authorization hook, consulted after validation and before the controller
/// instance is resolved. Enforcement policy belongs to the embedder; the
/// default allows everything.
pub trait ActionGuard: Send + Sync + 'static {
    fn check(&self, controller: &str, method: &str) -> Result<(), ActionError>;
}

/// The default guard: every call passes.
pub struct AllowAll;

impl ActionGuard for AllowAll {
    fn check(&self, _controller: &str, _method: &str) -> Result<(), ActionError> {
        Ok(())
    }
}
