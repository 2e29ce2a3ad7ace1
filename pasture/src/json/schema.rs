//! Output schemas and validation with coercion.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

use crate::errors::{ErrorInfo, PipelineValidationError};

/// A value did not satisfy a schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct SchemaViolation {
    /// JSON path of the offending value (`$` is the root).
    pub path: String,
    /// What was wrong.
    pub message: String,
}

impl SchemaViolation {
    /// Creates a violation at `path`.
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Structural validation capability for step output.
pub trait Schema: Send + Sync + fmt::Debug {
    /// Validates `data`, returning the coerced value.
    fn validate(&self, data: &Value) -> Result<Value, SchemaViolation>;

    /// Describes the expected shape as JSON, for prompts and chat `format` hints.
    fn describe(&self) -> Value;
}

/// Validates `data` against `schema` without failing.
///
/// Returns `(true, coerced)` on success and `(false, data)` otherwise.
#[must_use]
pub fn validate_with_schema(data: &Value, schema: &dyn Schema) -> (bool, Value) {
    match schema.validate(data) {
        Ok(value) => (true, value),
        Err(violation) => {
            tracing::debug!(%violation, "Schema validation failed");
            (false, data.clone())
        }
    }
}

/// Type of a schema field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// A string. Numbers and booleans are coerced to their text.
    String,
    /// A whole number. Integral floats and numeric strings are coerced.
    Integer,
    /// Any number. Numeric strings are coerced.
    Number,
    /// A boolean. `"true"`/`"false"` strings are coerced.
    Boolean,
    /// An array whose items all have the given type.
    Array(Box<FieldType>),
    /// A nested object.
    Object(Box<ObjectSchema>),
    /// Anything.
    Any,
}

impl FieldType {
    fn type_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Any => "any",
        }
    }

    fn describe(&self) -> Value {
        match self {
            Self::Array(items) => json!({ "type": "array", "items": items.describe() }),
            Self::Object(schema) => schema.describe(),
            Self::Any => json!({}),
            other => json!({ "type": other.type_name() }),
        }
    }

    fn coerce(&self, value: &Value, path: &str) -> Result<Value, SchemaViolation> {
        let mismatch = || {
            SchemaViolation::new(
                path,
                format!("expected {}, found {}", self.type_name(), kind_of(value)),
            )
        };
        match (self, value) {
            (Self::Any, _) => Ok(value.clone()),
            (Self::String, Value::String(_)) => Ok(value.clone()),
            (Self::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (Self::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (Self::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    Ok(value.clone())
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                        .map(|f| json!(f as i64))
                        .ok_or_else(mismatch)
                }
            }
            (Self::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().map(|i| json!(i)).map_err(|_| mismatch())
            }
            (Self::Number, Value::Number(_)) => Ok(value.clone()),
            (Self::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| json!(f))
                .ok_or_else(mismatch),
            (Self::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (Self::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (Self::Array(items), Value::Array(values)) => values
                .iter()
                .enumerate()
                .map(|(i, item)| items.coerce(item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            (Self::Object(schema), Value::Object(_)) => schema.validate_at(value, path),
            _ => Err(mismatch()),
        }
    }

    fn from_description(description: &Value, path: &str) -> Result<Self, String> {
        let kind = description.get("type").and_then(Value::as_str);
        match kind {
            None => Ok(Self::Any),
            Some("string") => Ok(Self::String),
            Some("integer") => Ok(Self::Integer),
            Some("number") => Ok(Self::Number),
            Some("boolean") => Ok(Self::Boolean),
            Some("array") => {
                let items = description
                    .get("items")
                    .map(|items| Self::from_description(items, &format!("{path}[]")))
                    .transpose()?
                    .unwrap_or(Self::Any);
                Ok(Self::Array(Box::new(items)))
            }
            Some("object") => Ok(Self::Object(Box::new(ObjectSchema::parse(description, path)?))),
            Some(other) => Err(format!("{path}: unsupported type '{other}'")),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One field of an [`ObjectSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
    /// Whether the field must be present.
    pub required: bool,
    /// Optional description included in prompts.
    pub description: Option<String>,
}

/// Schema for JSON objects with typed fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectSchema {
    fields: Vec<FieldSpec>,
    deny_unknown: bool,
}

impl ObjectSchema {
    /// Creates an empty schema that accepts any object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            field_type,
            required: true,
            description: None,
        });
        self
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            field_type,
            required: false,
            description: None,
        });
        self
    }

    /// Describes the most recently added field.
    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.description = Some(description.into());
        }
        self
    }

    /// Rejects fields the schema does not declare.
    #[must_use]
    pub fn deny_unknown_fields(mut self) -> Self {
        self.deny_unknown = true;
        self
    }

    /// Returns the declared fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Builds a schema from a JSON-Schema-like description.
    ///
    /// Supports `type`, `properties`, `required`, `items`, `description` and
    /// `additionalProperties: false`.
    ///
    /// # Errors
    ///
    /// Returns a `PIPELINE-SCHEMA` validation error for unsupported types or
    /// a non-object root.
    pub fn from_json(description: &Value) -> Result<Self, PipelineValidationError> {
        Self::parse(description, "$").map_err(|reason| {
            PipelineValidationError::new(format!("Invalid output schema: {reason}")).with_error_info(
                ErrorInfo::new("PIPELINE-SCHEMA", "Output schema could not be interpreted")
                    .with_fix_hint(
                        "Use an object schema whose field types are string, integer, number, boolean, array or object.",
                    ),
            )
        })
    }

    fn parse(description: &Value, path: &str) -> Result<Self, String> {
        match description.get("type").and_then(Value::as_str) {
            Some("object") | None => {}
            Some(other) => return Err(format!("{path}: root type must be 'object', found '{other}'")),
        }
        let required: Vec<&str> = description
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut schema = Self {
            fields: Vec::new(),
            deny_unknown: description.get("additionalProperties") == Some(&Value::Bool(false)),
        };
        if let Some(properties) = description.get("properties").and_then(Value::as_object) {
            for (name, property) in properties {
                schema.fields.push(FieldSpec {
                    name: name.clone(),
                    field_type: FieldType::from_description(property, &format!("{path}.{name}"))?,
                    required: required.contains(&name.as_str()),
                    description: property
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
        }
        Ok(schema)
    }

    fn validate_at(&self, data: &Value, path: &str) -> Result<Value, SchemaViolation> {
        let object = data.as_object().ok_or_else(|| {
            SchemaViolation::new(path, format!("expected object, found {}", kind_of(data)))
        })?;

        let mut out = Map::new();
        for field in &self.fields {
            let field_path = format!("{path}.{}", field.name);
            match object.get(&field.name) {
                Some(Value::Null) | None if field.required => {
                    return Err(SchemaViolation::new(field_path, "missing required field"));
                }
                Some(Value::Null) | None => {}
                Some(value) => {
                    out.insert(field.name.clone(), field.field_type.coerce(value, &field_path)?);
                }
            }
        }
        for (name, value) in object {
            if self.fields.iter().any(|field| &field.name == name) {
                continue;
            }
            if self.deny_unknown {
                return Err(SchemaViolation::new(
                    format!("{path}.{name}"),
                    "unexpected field",
                ));
            }
            out.insert(name.clone(), value.clone());
        }
        Ok(Value::Object(out))
    }
}

impl Schema for ObjectSchema {
    fn validate(&self, data: &Value) -> Result<Value, SchemaViolation> {
        self.validate_at(data, "$")
    }

    fn describe(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mut property = field.field_type.describe();
            if let (Some(text), Some(map)) = (&field.description, property.as_object_mut()) {
                map.insert("description".to_string(), json!(text));
            }
            properties.insert(field.name.clone(), property);
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required)
            .map(|field| field.name.as_str())
            .collect();

        let mut description = json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
        if self.deny_unknown {
            description["additionalProperties"] = json!(false);
        }
        description
    }
}

/// Schema backed by a serde type: valid data is whatever deserializes into `T`.
pub struct TypedSchema<T> {
    description: Value,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a schema described only by the type name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: json!({ "type": "object", "title": std::any::type_name::<T>() }),
            _marker: PhantomData,
        }
    }

    /// Sets the description shown to models.
    #[must_use]
    pub fn with_description(mut self, description: Value) -> Self {
        self.description = description;
        self
    }
}

impl<T> Default for TypedSchema<T>
where
    T: Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TypedSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedSchema")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Schema for TypedSchema<T>
where
    T: Serialize + DeserializeOwned,
{
    fn validate(&self, data: &Value) -> Result<Value, SchemaViolation> {
        let typed: T = serde_json::from_value(data.clone())
            .map_err(|err| SchemaViolation::new("$", err.to_string()))?;
        serde_json::to_value(typed).map_err(|err| SchemaViolation::new("$", err.to_string()))
    }

    fn describe(&self) -> Value {
        self.description.clone()
    }
}
