/*
 * path.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The path resolver.
//!
//! Dotted expressions (`.firstName`, `person.address.city`) are walked
//! against a [`TypedValue`]. Resolution is driven by the static shape, not
//! by the live value: an unknown record property is fatal even when no
//! live object is present, which is what allows a page to be validated
//! without data. Mapping key lookups are the one lenient spot — an absent
//! key resolves to a null value of the mapping's declared value shape.

use thiserror::Error;

use crate::value::{Shape, TypedValue, Value};

/// Why a path expression failed to resolve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    /// A segment names a property the record type does not declare.
    #[error("unknown property `{segment}` on {shape}")]
    UnknownProperty { segment: String, shape: String },

    /// A segment was applied to a value with no properties to walk.
    #[error("`{segment}` cannot be resolved against a {shape} value")]
    NotTraversable { segment: String, shape: String },
}

/// Split an expression into its segments. A leading dot refers to the
/// context itself, so `.name` and `name` resolve identically; `.` alone
/// (or the empty expression) denotes the context value.
pub fn segments(expression: &str) -> Vec<&str> {
    let trimmed = expression.trim();
    let trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('.').collect()
    }
}

/// Whether `shape` can resolve `segment` as its first step. Used when
/// choosing which bound frame a path applies to.
pub fn admits(shape: &Shape, segment: &str) -> bool {
    match shape {
        Shape::Mapping(_) => true,
        Shape::Record(record) => record.properties.contains_key(segment),
        Shape::Scalar | Shape::Sequence(_) => false,
    }
}

/// Resolve a dotted expression against a typed context value.
///
/// When `context.value` is `None` (static-check mode), only the shapes are
/// walked and the result carries no value either.
pub fn resolve(expression: &str, context: &TypedValue) -> Result<TypedValue, ResolveError> {
    let mut current = context.clone();
    for segment in segments(expression) {
        current = step(&current, segment)?;
    }
    Ok(current)
}

/// Resolve one path segment.
fn step(current: &TypedValue, segment: &str) -> Result<TypedValue, ResolveError> {
    match &current.shape {
        Shape::Mapping(value_shape) => {
            let value = match &current.value {
                Some(Value::Map(entries)) => Some(entries.get(segment).cloned().unwrap_or(Value::Null)),
                Some(_) => Some(Value::Null),
                None => None,
            };
            Ok(TypedValue {
                value,
                shape: (**value_shape).clone(),
            })
        }
        Shape::Record(record) => {
            let property_shape =
                record
                    .properties
                    .get(segment)
                    .ok_or_else(|| ResolveError::UnknownProperty {
                        segment: segment.to_string(),
                        shape: current.shape.describe(),
                    })?;
            let value = current.value.as_ref().map(|v| read_property(v, segment));
            Ok(TypedValue {
                value,
                shape: property_shape.clone(),
            })
        }
        Shape::Scalar | Shape::Sequence(_) => Err(ResolveError::NotTraversable {
            segment: segment.to_string(),
            shape: current.shape.describe(),
        }),
    }
}

/// Read a declared property off a live value. A getter that yields
/// nothing reads as null; existence was already settled by the shape.
fn read_property(value: &Value, property: &str) -> Value {
    match value {
        Value::Record(record) => record.get(property).unwrap_or(Value::Null),
        // Plain maps back anonymous record shapes inferred from data.
        Value::Map(entries) => entries.get(property).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{MapRecord, RecordShape};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn person_shape() -> Shape {
        Shape::Record(Arc::new(
            RecordShape::new("person")
                .property("firstName", Shape::Scalar)
                .property("address", address_shape()),
        ))
    }

    fn address_shape() -> Shape {
        Shape::Record(Arc::new(
            RecordShape::new("address").property("city", Shape::Scalar),
        ))
    }

    fn ada() -> TypedValue {
        let address = MapRecord::new("address").field("city", Value::Str("London".into()));
        let person = MapRecord::new("person")
            .field("firstName", Value::Str("Ada".into()))
            .field("address", address.into_value());
        TypedValue::new(person.into_value(), person_shape())
    }

    #[test]
    fn test_segments() {
        assert_eq!(segments(".firstName"), vec!["firstName"]);
        assert_eq!(segments("a.b.c"), vec!["a", "b", "c"]);
        assert_eq!(segments("."), Vec::<&str>::new());
        assert_eq!(segments(""), Vec::<&str>::new());
        assert_eq!(segments("  .name "), vec!["name"]);
    }

    #[test]
    fn test_resolve_property() {
        let got = resolve(".firstName", &ada()).unwrap();
        assert_eq!(got.value, Some(Value::Str("Ada".into())));
        assert_eq!(got.shape, Shape::Scalar);
    }

    #[test]
    fn test_resolve_nested() {
        let got = resolve("address.city", &ada()).unwrap();
        assert_eq!(got.value, Some(Value::Str("London".into())));
    }

    #[test]
    fn test_empty_path_is_context_itself() {
        let got = resolve(".", &ada()).unwrap();
        assert_eq!(got.shape, person_shape());
    }

    #[test]
    fn test_unknown_property_is_fatal() {
        let err = resolve(".nope", &ada()).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownProperty {
                segment: "nope".into(),
                shape: "record `person`".into(),
            }
        );
    }

    #[test]
    fn test_unknown_property_is_fatal_without_live_value() {
        // Structural validation must not depend on data.
        let unbound = TypedValue::unbound(person_shape());
        assert!(resolve(".nope", &unbound).is_err());
        let got = resolve("address.city", &unbound).unwrap();
        assert_eq!(got.value, None);
        assert_eq!(got.shape, Shape::Scalar);
    }

    #[test]
    fn test_mapping_absent_key_is_null() {
        let mut entries = BTreeMap::new();
        entries.insert("en".to_string(), Value::Str("hello".into()));
        let context = TypedValue::new(
            Value::Map(entries),
            Shape::Mapping(Box::new(Shape::Scalar)),
        );

        let hit = resolve("en", &context).unwrap();
        assert_eq!(hit.value, Some(Value::Str("hello".into())));

        let miss = resolve("fr", &context).unwrap();
        assert_eq!(miss.value, Some(Value::Null));
        assert_eq!(miss.shape, Shape::Scalar);
    }

    #[test]
    fn test_scalar_is_not_traversable() {
        let context = TypedValue::new(Value::Int(1), Shape::Scalar);
        assert!(matches!(
            resolve(".anything", &context),
            Err(ResolveError::NotTraversable { .. })
        ));
    }

    #[test]
    fn test_admits() {
        assert!(admits(&person_shape(), "firstName"));
        assert!(!admits(&person_shape(), "nope"));
        assert!(admits(&Shape::Mapping(Box::new(Shape::Scalar)), "anything"));
        assert!(!admits(&Shape::Scalar, "x"));
    }
}
