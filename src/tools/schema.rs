//! Flat argument schemas.
//!
//! Arguments must be a JSON object. Required fields must be present, present
//! fields must have the declared kind, and fields the schema does not name are
//! rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON kind accepted for one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    /// JSON string.
    Str,
    /// JSON integer (no fractional part in the source text).
    Int,
    /// JSON boolean.
    Bool,
    /// JSON object.
    Dict,
    /// JSON array.
    List,
    /// Anything, including null.
    Any,
}

impl ArgKind {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Dict => "dict",
            Self::List => "list",
            Self::Any => "any",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Dict => value.is_object(),
            Self::List => value.is_array(),
            Self::Any => true,
        }
    }
}

/// One named argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgField {
    /// Field name.
    pub name: String,
    /// Whether the field must be present.
    pub required: bool,
    /// Accepted kind.
    pub kind: ArgKind,
}

impl ArgField {
    /// A required field.
    pub fn required(name: &str, kind: ArgKind) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            kind,
        }
    }

    /// An optional field.
    pub fn optional(name: &str, kind: ArgKind) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            kind,
        }
    }
}

/// Why a set of arguments was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    /// Arguments are not a JSON object.
    #[error("arguments must be an object, got {0}")]
    NotAnObject(&'static str),

    /// A required field is absent.
    #[error("missing required argument '{0}'")]
    MissingField(String),

    /// A field has the wrong JSON kind.
    #[error("argument '{field}' must be {expected}")]
    WrongKind {
        /// Offending field.
        field: String,
        /// Kind the schema declares.
        expected: &'static str,
    },

    /// Fields the schema does not name.
    #[error("unexpected arguments: {}", .0.join(", "))]
    UnexpectedFields(Vec<String>),
}

/// Validate `args` against `schema`.
///
/// # Errors
///
/// Returns the first [`SchemaViolation`] found. Unknown fields are reported
/// together, in key order.
pub fn validate(schema: &[ArgField], args: &Value) -> Result<(), SchemaViolation> {
    let Some(object) = args.as_object() else {
        return Err(SchemaViolation::NotAnObject(json_kind(args)));
    };

    for field in schema {
        match object.get(&field.name) {
            None if field.required => {
                return Err(SchemaViolation::MissingField(field.name.clone()));
            }
            None => {}
            Some(value) if !field.kind.matches(value) => {
                return Err(SchemaViolation::WrongKind {
                    field: field.name.clone(),
                    expected: field.kind.as_str(),
                });
            }
            Some(_) => {}
        }
    }

    let mut unexpected: Vec<String> = object
        .keys()
        .filter(|key| !schema.iter().any(|f| &f.name == *key))
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        return Err(SchemaViolation::UnexpectedFields(unexpected));
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
