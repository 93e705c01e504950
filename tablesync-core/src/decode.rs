//! Turns a payload into a [`DecodedRecord`]. Payloads are JSON objects carrying at least an
//! identifier field and a value field, anything else in the object is ignored. Both fields are
//! checked against the column types of the target table before a write is ever attempted, so a
//! failure here is always a property of the message itself and retrying cannot fix it.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

use crate::message::{DecodedRecord, FieldValue, RecordKey};

/// Column type of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum IdType {
    /// Accepts non-empty strings and integers (stored as their decimal text).
    #[default]
    Text,
    /// Accepts integers and strings holding an integer.
    Integer,
}

/// Column type of the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ValueType {
    #[default]
    Integer,
    Float,
    Text,
    Json,
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdType::Text => write!(f, "text"),
            IdType::Integer => write!(f, "integer"),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Integer => write!(f, "integer"),
            ValueType::Float => write!(f, "float"),
            ValueType::Text => write!(f, "text"),
            ValueType::Json => write!(f, "json"),
        }
    }
}

impl FromStr for IdType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(IdType::Text),
            "integer" => Ok(IdType::Integer),
            other => Err(format!("unknown identifier type {other:?}")),
        }
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "integer" => Ok(ValueType::Integer),
            "float" => Ok(ValueType::Float),
            "text" => Ok(ValueType::Text),
            "json" => Ok(ValueType::Json),
            other => Err(format!("unknown value type {other:?}")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum DecodeError {
    #[error("payload is not valid JSON - {0}")]
    Malformed(String),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),

    #[error("identifier field {0:?} is missing")]
    MissingIdentifier(String),

    #[error("identifier field {field:?} must be {expected}, found {found}")]
    InvalidIdentifier {
        field: String,
        expected: IdType,
        found: String,
    },

    #[error("value field {field:?} is missing")]
    MissingValue { id: RecordKey, field: String },

    #[error("value field {field:?} must be {expected}, found {found}")]
    InvalidValue {
        id: RecordKey,
        field: String,
        expected: ValueType,
        found: String,
    },
}

impl DecodeError {
    /// The identifier of the record, when it could be extracted before decoding failed.
    pub(crate) fn identifier(&self) -> Option<&RecordKey> {
        match self {
            DecodeError::MissingValue { id, .. } | DecodeError::InvalidValue { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Decodes payloads for one target table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Decoder {
    id_field: String,
    value_field: String,
    id_type: IdType,
    value_type: ValueType,
}

impl Decoder {
    pub(crate) fn new(
        id_field: impl Into<String>,
        value_field: impl Into<String>,
        id_type: IdType,
        value_type: ValueType,
    ) -> Self {
        Self {
            id_field: id_field.into(),
            value_field: value_field.into(),
            id_type,
            value_type,
        }
    }

    pub(crate) fn decode(&self, payload: &[u8]) -> Result<DecodedRecord, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Malformed("empty payload".to_string()));
        }
        let document: Value =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Value::Object(mut fields) = document else {
            return Err(DecodeError::NotAnObject(kind(&document)));
        };

        let id = match fields.remove(&self.id_field) {
            None => return Err(DecodeError::MissingIdentifier(self.id_field.clone())),
            Some(raw) => self.validate_id(raw)?,
        };

        let value = match fields.remove(&self.value_field) {
            None => {
                return Err(DecodeError::MissingValue {
                    id,
                    field: self.value_field.clone(),
                });
            }
            Some(raw) => match self.validate_value(raw) {
                Ok(value) => value,
                Err(found) => {
                    return Err(DecodeError::InvalidValue {
                        id,
                        field: self.value_field.clone(),
                        expected: self.value_type,
                        found,
                    });
                }
            },
        };

        Ok(DecodedRecord { id, value })
    }

    fn validate_id(&self, raw: Value) -> Result<RecordKey, DecodeError> {
        let invalid = |found: String| DecodeError::InvalidIdentifier {
            field: self.id_field.clone(),
            expected: self.id_type,
            found,
        };

        match (self.id_type, raw) {
            (_, Value::String(s)) if s.is_empty() => Err(invalid("empty string".to_string())),
            (IdType::Text, Value::String(s)) => Ok(RecordKey::Text(s)),
            (IdType::Text, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(RecordKey::Text(n.to_string()))
            }
            (IdType::Integer, Value::Number(n)) => n
                .as_i64()
                .map(RecordKey::Integer)
                .ok_or_else(|| invalid(describe(&Value::Number(n)))),
            (IdType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(RecordKey::Integer)
                .map_err(|_| invalid(format!("string {s:?}"))),
            (_, other) => Err(invalid(describe(&other))),
        }
    }

    /// Err carries a description of what was found instead.
    fn validate_value(&self, raw: Value) -> Result<FieldValue, String> {
        match (self.value_type, raw) {
            (_, Value::Null) => Err("null".to_string()),
            (ValueType::Integer, Value::Number(n)) => match n.as_i64() {
                Some(i) => Ok(FieldValue::Integer(i)),
                None => Err(describe(&Value::Number(n))),
            },
            (ValueType::Float, Value::Number(n)) => match n.as_f64() {
                Some(v) => Ok(FieldValue::Float(v)),
                None => Err(describe(&Value::Number(n))),
            },
            (ValueType::Text, Value::String(s)) => Ok(FieldValue::Text(s)),
            (ValueType::Json, other) => Ok(FieldValue::Json(other)),
            (_, other) => Err(describe(&other)),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Number(n) => format!("number {n}"),
        other => kind(other).to_string(),
    }
}
