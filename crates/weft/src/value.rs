/*
 * value.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Template values and their static type descriptors.
//!
//! The interpreter never re-derives the shape of a value from runtime
//! metadata: every resolved value travels with a [`Shape`] describing what
//! it is statically known to be. This is what makes static-only checking
//! possible — a [`TypedValue`] with no live value still has a full shape
//! and can be walked by the path resolver.
//!
//! Conversion from `serde_json::Value` is provided so callers can use plain
//! JSON documents as contexts without declaring record shapes by hand.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A value resolvable by path expressions and renderable as text.
#[derive(Debug, Clone)]
pub enum Value {
    /// A null/missing value.
    Null,
    /// A boolean value.
    Bool(bool),
    /// An integer value.
    Int(i64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    Str(String),
    /// An ordered sequence of values.
    Seq(Vec<Value>),
    /// A string-keyed mapping. `BTreeMap` keeps iteration deterministic.
    Map(BTreeMap<String, Value>),
    /// An opaque record exposing read-only properties.
    Record(Arc<dyn Record>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // Records are compared by identity only.
            (Value::Record(a), Value::Record(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Value {
    /// Truthiness for `@If` / `@Unless`:
    /// booleans as-is, collections by emptiness, null false, anything else true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Seq(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            _ => true,
        }
    }

    /// Default string conversion used by `@Get` when no other conversion
    /// is installed on the engine.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Str(s) => s.clone(),
            Value::Seq(items) => items.iter().map(Value::render).collect(),
            Value::Map(entries) => entries.values().map(Value::render).collect(),
            Value::Record(r) => r.display(),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Read-only property access for opaque record values.
///
/// This is the seam to the host application's property machinery: the
/// engine only consumes it, it never introspects instances on its own.
/// The set of properties a record type exposes is declared separately as
/// a [`RecordShape`]; a getter returning `None` for a declared property
/// reads as [`Value::Null`].
pub trait Record: fmt::Debug + Send + Sync {
    /// Name of the record type, matching its registered [`RecordShape`].
    fn type_name(&self) -> &str;

    /// Read a property value.
    fn get(&self, property: &str) -> Option<Value>;

    /// String conversion when the record itself is rendered.
    fn display(&self) -> String {
        self.type_name().to_string()
    }
}

/// Statically declared properties of a record type.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordShape {
    /// Type name used by `@Bind(name)` and instance provider lookups.
    pub name: String,
    /// Property name to shape of the property's value.
    pub properties: BTreeMap<String, Shape>,
}

impl RecordShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a property declaration (builder style).
    pub fn property(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.properties.insert(name.into(), shape);
        self
    }
}

/// Static type descriptor carried alongside every resolved value.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// An atomic value: string, number, boolean.
    Scalar,
    /// String-keyed mapping; all values share the declared shape.
    /// Key lookups never fail statically — an absent key reads as null.
    Mapping(Box<Shape>),
    /// Ordered sequence of elements of one shape.
    Sequence(Box<Shape>),
    /// A record with a fixed property table. Unknown properties are fatal.
    Record(Arc<RecordShape>),
}

impl Shape {
    /// Short description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Shape::Scalar => "scalar".to_string(),
            Shape::Mapping(_) => "mapping".to_string(),
            Shape::Sequence(_) => "sequence".to_string(),
            Shape::Record(r) => format!("record `{}`", r.name),
        }
    }

    /// Infer a shape from a live value. Used when callers supply plain
    /// data (e.g. JSON) without declaring record shapes: objects become
    /// anonymous records so that unknown properties stay fatal.
    pub fn of_value(value: &Value) -> Shape {
        match value {
            Value::Map(entries) => {
                let mut shape = RecordShape::new("object");
                for (k, v) in entries {
                    shape.properties.insert(k.clone(), Shape::of_value(v));
                }
                Shape::Record(Arc::new(shape))
            }
            Value::Seq(items) => {
                let elem = items.first().map(Shape::of_value).unwrap_or(Shape::Scalar);
                Shape::Sequence(Box::new(elem))
            }
            _ => Shape::Scalar,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// A resolved value paired with its static shape.
///
/// `value` is `None` in static-check mode (no live data) and for absent
/// mapping keys; the shape is always present.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub value: Option<Value>,
    pub shape: Shape,
}

impl TypedValue {
    pub fn new(value: Value, shape: Shape) -> Self {
        Self {
            value: Some(value),
            shape,
        }
    }

    /// A shape with no live value, as used during static checking.
    pub fn unbound(shape: Shape) -> Self {
        Self { value: None, shape }
    }

    /// Build a typed value from plain data, inferring its shape.
    pub fn of_value(value: Value) -> Self {
        let shape = Shape::of_value(&value);
        Self::new(value, shape)
    }

    pub fn is_truthy(&self) -> bool {
        self.value.as_ref().is_some_and(Value::is_truthy)
    }
}

/// Table of declared record shapes, consulted by `@Bind(type)`.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    records: HashMap<String, Arc<RecordShape>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, shape: RecordShape) {
        self.records.insert(shape.name.clone(), Arc::new(shape));
    }

    pub fn get(&self, name: &str) -> Option<Arc<RecordShape>> {
        self.records.get(name).cloned()
    }
}

/// Failure reported by an [`InstanceProvider`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProvideError {
    pub message: String,
}

impl ProvideError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Supplies live instances for `@Bind(type)` during rendering.
///
/// Invoked only when output is requested; static checking records the
/// type without asking for an instance.
pub trait InstanceProvider {
    fn provide(&self, type_name: &str) -> Result<Value, ProvideError>;
}

/// Instance provider backed by a map of pre-built values.
#[derive(Debug, Clone, Default)]
pub struct MapProvider {
    instances: HashMap<String, Value>,
}

impl MapProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, type_name: impl Into<String>, instance: Value) -> &mut Self {
        self.instances.insert(type_name.into(), instance);
        self
    }
}

impl InstanceProvider for MapProvider {
    fn provide(&self, type_name: &str) -> Result<Value, ProvideError> {
        self.instances
            .get(type_name)
            .cloned()
            .ok_or_else(|| ProvideError::new(format!("no instance registered for `{type_name}`")))
    }
}

/// A [`Record`] backed by a field map. Convenient for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MapRecord {
    type_name: String,
    fields: BTreeMap<String, Value>,
}

impl MapRecord {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Wrap into a [`Value::Record`].
    pub fn into_value(self) -> Value {
        Value::Record(Arc::new(self))
    }
}

impl Record for MapRecord {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get(&self, property: &str) -> Option<Value> {
        self.fields.get(property).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Null.is_truthy());

        // Collections go by emptiness.
        assert!(!Value::Seq(vec![]).is_truthy());
        assert!(Value::Seq(vec![Value::Bool(false)]).is_truthy());
        assert!(!Value::Map(BTreeMap::new()).is_truthy());

        // Any other non-null value is true, including empty strings and zero.
        assert!(Value::Str(String::new()).is_truthy());
        assert!(Value::Int(0).is_truthy());
    }

    #[test]
    fn test_default_render() {
        assert_eq!(Value::Null.render(), "");
        assert_eq!(Value::Str("x".into()).render(), "x");
        assert_eq!(Value::Int(42).render(), "42");
        assert_eq!(Value::Bool(true).render(), "true");
        assert_eq!(
            Value::Seq(vec![Value::Str("a".into()), Value::Str("b".into())]).render(),
            "ab"
        );
    }

    #[test]
    fn test_from_json() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"name": "Ada", "tags": ["a", "b"], "age": 36}"#).unwrap();
        let value = Value::from(json);

        let Value::Map(entries) = &value else {
            panic!("expected map")
        };
        assert_eq!(entries.get("name"), Some(&Value::Str("Ada".into())));
        assert_eq!(entries.get("age"), Some(&Value::Int(36)));
    }

    #[test]
    fn test_shape_inference_makes_objects_records() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"person": {"name": "Ada"}, "tags": ["x"]}"#).unwrap();
        let shape = Shape::of_value(&Value::from(json));

        let Shape::Record(record) = shape else {
            panic!("expected record shape")
        };
        assert!(matches!(
            record.properties.get("person"),
            Some(Shape::Record(_))
        ));
        assert!(matches!(
            record.properties.get("tags"),
            Some(Shape::Sequence(_))
        ));
    }

    #[test]
    fn test_map_record() {
        let record = MapRecord::new("person")
            .field("name", Value::Str("Ada".into()))
            .field("age", Value::Int(36));
        assert_eq!(record.type_name(), "person");
        assert_eq!(record.get("name"), Some(Value::Str("Ada".into())));
        assert_eq!(record.get("missing"), None);
    }

    #[test]
    fn test_map_provider() {
        let mut provider = MapProvider::new();
        provider.add("config", Value::Str("x".into()));
        assert!(provider.provide("config").is_ok());
        assert!(provider.provide("other").is_err());
    }

    #[test]
    fn test_type_registry() {
        let mut registry = TypeRegistry::new();
        registry.register(RecordShape::new("person").property("name", Shape::Scalar));
        assert!(registry.get("person").is_some());
        assert!(registry.get("robot").is_none());
    }
}
