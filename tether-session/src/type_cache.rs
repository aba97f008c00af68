//! Per-(controller, method) codec bundles, built lazily and memoized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tether_schema::{
    ArgsDecoder, ArgsValidator, PropertyDescriptor, Schema, TypeDescriptor, compile_args_decoder,
    compile_args_validator,
};

use crate::errors::DispatchError;
use crate::registry::ControllerRegistry;

/// Everything needed to decode, validate, and encode for one action.
/// Immutable after construction; the collection items schema is the one
/// lazily-initialized member, built on the first collection result.
pub struct ActionTypes {
    /// Parameter descriptors in declaration order.
    pub parameters: Vec<PropertyDescriptor>,
    /// The positional-args tuple as one object, one property per parameter.
    pub args_schema: Schema,
    /// The unwrapped return descriptor, renamed to `v` and marked optional.
    /// Wrapper types (future / push-source / collection) never reach the
    /// wire; only their element does.
    pub result_property: PropertyDescriptor,
    /// `{ v?: <unwrapped> }`.
    pub result_schema: Schema,
    /// `{ id: int, v?: <unwrapped> }` for streamed items.
    pub stream_item_schema: Schema,
    pub args_decode: ArgsDecoder,
    pub args_validate: ArgsValidator,
    collection_items: OnceLock<Schema>,
}

impl std::fmt::Debug for ActionTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionTypes")
            .field("parameters", &self.parameters)
            .field("args_schema", &self.args_schema)
            .field("result_property", &self.result_property)
            .field("result_schema", &self.result_schema)
            .field("stream_item_schema", &self.stream_item_schema)
            .finish_non_exhaustive()
    }
}

impl ActionTypes {
    /// `{ v: array<unwrapped> }`, built on first use.
    pub fn collection_items_schema(&self) -> &Schema {
        self.collection_items.get_or_init(|| {
            let mut schema = Schema::new();
            schema.register(PropertyDescriptor::required(
                "v",
                TypeDescriptor::Array { element: Box::new(self.result_property.ty.clone()) },
            ));
            schema
        })
    }
}

/// Memoized [`ActionTypes`] per (controller, method).
///
/// Concurrent first loads may both build; the first insertion wins and the
/// loser's bundle is discarded. The results are value-equal, and an entry
/// is never visible partially constructed.
pub struct TypeCache {
    entries: Mutex<HashMap<(String, String), Arc<ActionTypes>>>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn load(
        &self,
        registry: &ControllerRegistry,
        controller: &str,
        method: &str,
    ) -> Result<Arc<ActionTypes>, DispatchError> {
        let key = (controller.to_string(), method.to_string());
        if let Some(hit) = self.entries.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let built = Arc::new(build_action_types(registry, controller, method)?);
        trace!(controller, method, "action types built");

        let mut entries = self.entries.lock().unwrap();
        Ok(entries.entry(key).or_insert(built).clone())
    }
}

impl Default for TypeCache {
    fn default() -> Self {
        Self::new()
    }
}

fn build_action_types(
    registry: &ControllerRegistry,
    controller: &str,
    method: &str,
) -> Result<ActionTypes, DispatchError> {
    let class = registry
        .get(controller)
        .ok_or_else(|| DispatchError::UnknownController(controller.to_string()))?;
    let unknown_action = || DispatchError::UnknownAction {
        controller: controller.to_string(),
        method: method.to_string(),
    };
    let parameters = class.parameters_of(method).ok_or_else(unknown_action)?.to_vec();
    let declared_result = class.return_descriptor_of(method).cloned().ok_or_else(unknown_action)?;

    let mut args_schema = Schema::new();
    for parameter in &parameters {
        args_schema.register(parameter.clone());
    }

    // Unwrap the declared return type by exactly one level. A wrapper with
    // no declared element cannot be encoded, and that includes a wrapper
    // nested inside a wrapper.
    let mut result_property = declared_result;
    if let Some((kind, element)) = result_property.ty.wrapper() {
        let element = element.cloned().ok_or(DispatchError::MissingGeneric {
            method: method.to_string(),
            wrapper: kind,
        })?;
        if let Some((inner_kind, _)) = element.wrapper() {
            return Err(DispatchError::MissingGeneric {
                method: method.to_string(),
                wrapper: inner_kind,
            });
        }
        result_property = PropertyDescriptor {
            name: result_property.name,
            ty: element,
            optional: result_property.optional,
        };
    }
    let mut result_property = result_property.renamed("v");
    result_property.optional = true;

    let mut result_schema = Schema::new();
    result_schema.register(result_property.clone());

    let mut stream_item_schema = Schema::stream_envelope();
    stream_item_schema.register(result_property.clone());

    let args_decode = compile_args_decoder(&args_schema);
    let args_validate = compile_args_validator(&args_schema);

    Ok(ActionTypes {
        parameters,
        args_schema,
        result_property,
        result_schema,
        stream_item_schema,
        args_decode,
        args_validate,
        collection_items: OnceLock::new(),
    })
}
