//! # Payload schemas.
//!
//! Job input, step input/output, job output and progress payloads are JSON
//! objects checked against a [`Schema`]. The runner only ever calls
//! `decode`/`encode`; richer type systems can be plugged in by implementing
//! the trait.
//!
//! Schemas that expose their [`fields`](Schema::fields) also take part in the
//! construction-time checks of [`JobBuilder`](crate::jobs::JobBuilder): a step
//! may only require fields that the job input or an earlier step guarantees.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::SchemaError;

/// Decoder/encoder of one payload shape.
pub trait Schema: Send + Sync + fmt::Debug + 'static {
    /// Validates a raw payload and returns the decoded value.
    fn decode(&self, raw: &Value) -> Result<Value, SchemaError>;

    /// Validates a produced value and returns its wire form.
    fn encode(&self, value: &Value) -> Result<Value, SchemaError> {
        self.decode(value)
    }

    /// Declared fields, or `None` for an open shape.
    fn fields(&self) -> Option<&[Field]> {
        None
    }
}

/// Type of one object field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Anything but `null`.
    Any,
    /// `true`/`false`.
    Bool,
    /// Any JSON number.
    Number,
    /// Number without a fractional part.
    Integer,
    /// JSON string.
    String,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::Any => !value.is_null(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::String => value.is_string(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Any => "any value",
            FieldKind::Bool => "bool",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::String => "string",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }
}

/// One declared object field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    /// Key.
    pub name: String,
    /// Expected type.
    pub kind: FieldKind,
    /// Whether the key must be present (and not `null`).
    pub required: bool,
}

/// Object with a fixed set of typed fields. Unknown keys are dropped on decode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectSchema {
    fields: Vec<Field>,
}

impl ObjectSchema {
    /// Object without fields (decodes anything object-shaped to `{}`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Adds an optional field.
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }
}

impl Schema for ObjectSchema {
    fn decode(&self, raw: &Value) -> Result<Value, SchemaError> {
        let object = raw
            .as_object()
            .ok_or_else(|| SchemaError::new("$", "expected object"))?;

        let mut out = Map::with_capacity(self.fields.len());
        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(SchemaError::new(
                        format!("$.{}", field.name),
                        "missing required field",
                    ));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(SchemaError::new(
                        format!("$.{}", field.name),
                        format!("expected {}", field.kind.as_str()),
                    ));
                }
                Some(value) => {
                    out.insert(field.name.clone(), value.clone());
                }
            }
        }
        Ok(Value::Object(out))
    }

    fn fields(&self) -> Option<&[Field]> {
        Some(&self.fields)
    }
}

/// Any JSON object, passed through untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnyObject;

impl Schema for AnyObject {
    fn decode(&self, raw: &Value) -> Result<Value, SchemaError> {
        if raw.is_object() {
            Ok(raw.clone())
        } else {
            Err(SchemaError::new("$", "expected object"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> ObjectSchema {
        ObjectSchema::new()
            .field("id", FieldKind::Integer)
            .field("email", FieldKind::String)
            .optional("tags", FieldKind::Array)
    }

    #[test]
    fn test_decode_strips_unknown_keys() {
        let decoded = user()
            .decode(&json!({"id": 1, "email": "a@b.c", "admin": true}))
            .unwrap();
        assert_eq!(decoded, json!({"id": 1, "email": "a@b.c"}));
    }

    #[test]
    fn test_decode_reports_path_of_bad_field() {
        let err = user().decode(&json!({"id": 1.5, "email": "a@b.c"})).unwrap_err();
        assert_eq!(err.path, "$.id");
        assert_eq!(err.message, "expected integer");

        let err = user().decode(&json!({"id": 1, "email": null})).unwrap_err();
        assert_eq!(err.path, "$.email");

        let err = user().decode(&json!([1, 2])).unwrap_err();
        assert_eq!(err.path, "$");
    }

    #[test]
    fn test_any_object_requires_an_object() {
        assert!(AnyObject.decode(&json!({"x": 1})).is_ok());
        assert!(AnyObject.encode(&json!(3)).is_err());
        assert!(AnyObject.fields().is_none());
    }
}
