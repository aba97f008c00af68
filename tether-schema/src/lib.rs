#![deny(unsafe_code)]

//! Runtime type descriptors and schemas for the tether dispatcher.
//!
//! Controllers declare their parameter and return types as
//! [`TypeDescriptor`] values. The dispatcher clones descriptors, renames and
//! re-registers them into fresh [`Schema`]s, and compiles each schema once
//! into an argument decoder (wire value → native tuple) and a validator
//! (native tuple → failure list). Compilation happens per schema, not per
//! call: the per-property conversion and check steps are built up front and
//! the compiled closures only walk them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wrapper kinds a declared return type may carry. Wrappers never appear
/// on the wire; the dispatcher unwraps exactly one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrapperKind {
    #[serde(rename = "future")]
    Future,
    #[serde(rename = "push-source")]
    PushSource,
    #[serde(rename = "collection")]
    Collection,
}

impl std::fmt::Display for WrapperKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WrapperKind::Future => "future",
            WrapperKind::PushSource => "push-source",
            WrapperKind::Collection => "collection",
        };
        f.write_str(s)
    }
}

/// A declared type.
///
/// This is deliberately a small closed model: it covers what action
/// signatures are made of, not the full host type system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TypeDescriptor {
    /// No checking; values pass through untouched.
    Any,
    Bool,
    Int,
    Float,
    String,
    Array {
        element: Box<TypeDescriptor>,
    },
    /// A nested object; property values are not introspected further.
    Object,
    /// A wrapper around an element type: a future, a push source, or a live
    /// collection. `element` is `None` when the declaration omitted it.
    Wrapper {
        kind: WrapperKind,
        element: Option<Box<TypeDescriptor>>,
    },
}

impl TypeDescriptor {
    /// The wrapper kind and declared element, if this is a wrapper type.
    pub fn wrapper(&self) -> Option<(WrapperKind, Option<&TypeDescriptor>)> {
        match self {
            TypeDescriptor::Wrapper { kind, element } => {
                Some((*kind, element.as_deref()))
            }
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            TypeDescriptor::Any => "any",
            TypeDescriptor::Bool => "bool",
            TypeDescriptor::Int => "int",
            TypeDescriptor::Float => "float",
            TypeDescriptor::String => "string",
            TypeDescriptor::Array { .. } => "array",
            TypeDescriptor::Object => "object",
            TypeDescriptor::Wrapper { .. } => "wrapper",
        }
    }
}

/// A named, possibly optional property of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeDescriptor,
    pub optional: bool,
}

impl PropertyDescriptor {
    pub fn required(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self { name: name.into(), ty, optional: false }
    }

    pub fn optional(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self { name: name.into(), ty, optional: true }
    }

    /// Clone under a different name, as when the return descriptor becomes
    /// the `v` property of a result schema.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self { name: name.into(), ty: self.ty.clone(), optional: self.optional }
    }
}

/// An ordered set of named properties.
///
/// Registration order is the declaration order of the action parameters, and
/// the compiled decoder produces the native tuple in exactly that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    properties: Vec<PropertyDescriptor>,
}

impl Schema {
    pub fn new() -> Self {
        Self { properties: Vec::new() }
    }

    /// The standard stream-item envelope: `{ id: int }`. Callers clone it
    /// and register the item property onto it.
    pub fn stream_envelope() -> Self {
        let mut s = Self::new();
        s.register(PropertyDescriptor::required("id", TypeDescriptor::Int));
        s
    }

    /// Register a property. A property with the same name is replaced in
    /// place; otherwise the property is appended.
    pub fn register(&mut self, property: PropertyDescriptor) {
        if let Some(existing) =
            self.properties.iter_mut().find(|p| p.name == property.name)
        {
            *existing = property;
        } else {
            self.properties.push(property);
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    /// Project a body value onto this schema: declared properties are picked
    /// out of `body`, undeclared keys are dropped, and a missing required
    /// property is an error. The result is what goes on the wire.
    pub fn project(&self, body: &Value) -> Result<Value, SchemaError> {
        let map = match body {
            Value::Object(map) => map,
            other => return Err(SchemaError::NotAnObject(other.type_label())),
        };
        let mut out = serde_json::Map::new();
        for property in &self.properties {
            match map.get(&property.name) {
                Some(v) => {
                    out.insert(property.name.clone(), v.clone());
                }
                None if property.optional => {}
                None => {
                    return Err(SchemaError::MissingProperty(property.name.clone()));
                }
            }
        }
        Ok(Value::Object(out))
    }
}

trait TypeLabel {
    fn type_label(&self) -> &'static str;
}

impl TypeLabel for Value {
    fn type_label(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_f64() => "float",
            Value::Number(_) => "int",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// The body was expected to be a map.
    NotAnObject(&'static str),
    MissingProperty(String),
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::NotAnObject(got) => {
                write!(f, "expected an object body, got {got}")
            }
            SchemaError::MissingProperty(name) => {
                write!(f, "missing required property '{name}'")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

// ============================================================================
// Validation failures
// ============================================================================

/// Failure codes produced by compiled validators.
pub mod codes {
    pub const REQUIRED: &str = "required";
    pub const TYPE: &str = "type";
}

/// One validation failure: which argument, which rule, and a human message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub path: String,
    pub code: String,
    pub message: String,
}

impl ValidationFailure {
    fn required(path: String) -> Self {
        Self {
            message: format!("{path} is required"),
            code: codes::REQUIRED.into(),
            path,
        }
    }

    fn wrong_type(path: String, expected: &str, got: &str) -> Self {
        Self {
            message: format!("{path}: expected {expected}, got {got}"),
            code: codes::TYPE.into(),
            path,
        }
    }
}

// ============================================================================
// Compiled decoders and validators
// ============================================================================

/// Compiled wire → native argument decoder. Produces the positional tuple in
/// property registration order; absent properties decode to `Null` so the
/// validator owns the required-ness verdict.
pub type ArgsDecoder = Arc<dyn Fn(&Value) -> Result<Vec<Value>, SchemaError> + Send + Sync>;

/// Compiled validator over the native tuple. An empty result means the
/// arguments are acceptable.
pub type ArgsValidator = Arc<dyn Fn(&[Value]) -> Vec<ValidationFailure> + Send + Sync>;

/// Compile the decoder for an argument schema.
///
/// Decoding normalizes representations (an integral float collapses to an
/// int where an int is declared); it never rejects. Type mismatches survive
/// decoding untouched so the validator can report them with a path.
pub fn compile_args_decoder(schema: &Schema) -> ArgsDecoder {
    let steps: Vec<(String, TypeDescriptor)> = schema
        .properties()
        .iter()
        .map(|p| (p.name.clone(), p.ty.clone()))
        .collect();
    Arc::new(move |body: &Value| {
        let map = match body {
            Value::Object(map) => map,
            other => return Err(SchemaError::NotAnObject(other.type_label())),
        };
        let mut args = Vec::with_capacity(steps.len());
        for (name, ty) in &steps {
            let raw = map.get(name).cloned().unwrap_or(Value::Null);
            args.push(normalize(raw, ty));
        }
        Ok(args)
    })
}

/// Compile the validator for an argument schema.
pub fn compile_args_validator(schema: &Schema) -> ArgsValidator {
    let steps: Vec<PropertyDescriptor> = schema.properties().to_vec();
    Arc::new(move |args: &[Value]| {
        let mut failures = Vec::new();
        for (i, property) in steps.iter().enumerate() {
            let value = args.get(i).unwrap_or(&Value::Null);
            check(value, &property.ty, property.optional, &property.name, &mut failures);
        }
        failures
    })
}

fn normalize(value: Value, ty: &TypeDescriptor) -> Value {
    match (ty, value) {
        (TypeDescriptor::Int, Value::Number(n)) => {
            // Wire formats widen small integers to floats; fold them back.
            match n.as_f64() {
                Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Value::Number((f as i64).into())
                }
                _ => Value::Number(n),
            }
        }
        (TypeDescriptor::Float, Value::Number(n)) => match n.as_f64() {
            Some(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Number(n)),
            None => Value::Number(n),
        },
        (TypeDescriptor::Array { element }, Value::Array(items)) => Value::Array(
            items.into_iter().map(|item| normalize(item, element)).collect(),
        ),
        (_, value) => value,
    }
}

fn check(
    value: &Value,
    ty: &TypeDescriptor,
    optional: bool,
    path: &str,
    failures: &mut Vec<ValidationFailure>,
) {
    if value.is_null() {
        if !optional {
            failures.push(ValidationFailure::required(path.to_string()));
        }
        return;
    }
    match ty {
        TypeDescriptor::Any => {}
        TypeDescriptor::Bool => {
            if !value.is_boolean() {
                failures.push(ValidationFailure::wrong_type(
                    path.to_string(),
                    "bool",
                    value.type_label(),
                ));
            }
        }
        TypeDescriptor::Int => {
            if !matches!(value, Value::Number(n) if !n.is_f64()) {
                failures.push(ValidationFailure::wrong_type(
                    path.to_string(),
                    "int",
                    value.type_label(),
                ));
            }
        }
        TypeDescriptor::Float => {
            if !value.is_number() {
                failures.push(ValidationFailure::wrong_type(
                    path.to_string(),
                    "float",
                    value.type_label(),
                ));
            }
        }
        TypeDescriptor::String => {
            if !value.is_string() {
                failures.push(ValidationFailure::wrong_type(
                    path.to_string(),
                    "string",
                    value.type_label(),
                ));
            }
        }
        TypeDescriptor::Array { element } => match value {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    check(item, element, false, &format!("{path}[{i}]"), failures);
                }
            }
            other => failures.push(ValidationFailure::wrong_type(
                path.to_string(),
                "array",
                other.type_label(),
            )),
        },
        TypeDescriptor::Object => {
            if !value.is_object() {
                failures.push(ValidationFailure::wrong_type(
                    path.to_string(),
                    "object",
                    value.type_label(),
                ));
            }
        }
        TypeDescriptor::Wrapper { .. } => {
            // Wrappers never reach validation; argument schemas are built
            // from parameter descriptors, which cannot be wrappers.
            failures.push(ValidationFailure::wrong_type(
                path.to_string(),
                ty.type_name(),
                value.type_label(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_schema() -> Schema {
        let mut s = Schema::new();
        s.register(PropertyDescriptor::required("a", TypeDescriptor::Int));
        s.register(PropertyDescriptor::required("b", TypeDescriptor::Int));
        s
    }

    #[test]
    fn decoder_produces_args_in_declaration_order() {
        let decode = compile_args_decoder(&add_schema());
        let args = decode(&json!({ "b": 3, "a": 2 })).unwrap();
        assert_eq!(args, vec![json!(2), json!(3)]);
    }

    #[test]
    fn decoder_folds_integral_floats_into_ints() {
        let decode = compile_args_decoder(&add_schema());
        let args = decode(&json!({ "a": 2.0, "b": 3 })).unwrap();
        assert_eq!(args[0], json!(2));
        assert!(matches!(&args[0], Value::Number(n) if !n.is_f64()));
    }

    #[test]
    fn decoder_passes_mismatches_through_for_the_validator() {
        let decode = compile_args_decoder(&add_schema());
        let args = decode(&json!({ "a": "x", "b": 3 })).unwrap();
        assert_eq!(args[0], json!("x"));
    }

    #[test]
    fn validator_reports_wrong_type_with_path() {
        let validate = compile_args_validator(&add_schema());
        let failures = validate(&[json!("x"), json!(3)]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "a");
        assert_eq!(failures[0].code, codes::TYPE);
    }

    #[test]
    fn validator_reports_missing_required_argument() {
        let validate = compile_args_validator(&add_schema());
        let failures = validate(&[Value::Null, json!(3)]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "a");
        assert_eq!(failures[0].code, codes::REQUIRED);
    }

    #[test]
    fn validator_accepts_absent_optional_argument() {
        let mut s = add_schema();
        s.register(PropertyDescriptor::optional("c", TypeDescriptor::String));
        let decode = compile_args_decoder(&s);
        let validate = compile_args_validator(&s);
        let args = decode(&json!({ "a": 1, "b": 2 })).unwrap();
        assert_eq!(args.len(), 3);
        assert!(validate(&args).is_empty());
    }

    #[test]
    fn validator_descends_into_arrays() {
        let mut s = Schema::new();
        s.register(PropertyDescriptor::required(
            "xs",
            TypeDescriptor::Array { element: Box::new(TypeDescriptor::Int) },
        ));
        let validate = compile_args_validator(&s);
        let failures = validate(&[json!([1, "two", 3])]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "xs[1]");
    }

    #[test]
    fn projection_drops_undeclared_keys_and_requires_declared_ones() {
        let schema = add_schema();
        let projected = schema
            .project(&json!({ "a": 1, "b": 2, "noise": true }))
            .unwrap();
        assert_eq!(projected, json!({ "a": 1, "b": 2 }));

        let err = schema.project(&json!({ "a": 1 })).unwrap_err();
        assert_eq!(err, SchemaError::MissingProperty("b".into()));
    }

    #[test]
    fn register_replaces_same_named_property_in_place() {
        let mut s = add_schema();
        s.register(PropertyDescriptor::optional("a", TypeDescriptor::String));
        assert_eq!(s.properties().len(), 2);
        assert_eq!(s.properties()[0].name, "a");
        assert!(s.properties()[0].optional);
        assert_eq!(s.properties()[0].ty, TypeDescriptor::String);
    }

    #[test]
    fn wrapper_descriptor_exposes_kind_and_element() {
        let ty = TypeDescriptor::Wrapper {
            kind: WrapperKind::PushSource,
            element: Some(Box::new(TypeDescriptor::String)),
        };
        let (kind, element) = ty.wrapper().unwrap();
        assert_eq!(kind, WrapperKind::PushSource);
        assert_eq!(element, Some(&TypeDescriptor::String));

        let bare = TypeDescriptor::Wrapper { kind: WrapperKind::Collection, element: None };
        assert_eq!(bare.wrapper().unwrap(), (WrapperKind::Collection, None));
    }
}
