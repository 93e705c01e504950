use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A message as delivered by the stream, owned by the driver for one processing step.
#[derive(Debug, Clone)]
pub(crate) struct RawMessage {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) timestamp: Option<DateTime<Utc>>,
    pub(crate) key: Option<String>,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) payload: Bytes,
}

impl RawMessage {
    pub(crate) fn position(&self) -> Offset {
        Offset {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Position of a message within its partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Offset {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Unique key of a record in the target table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum RecordKey {
    Text(String),
    Integer(i64),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Text(s) => write!(f, "{s}"),
            RecordKey::Integer(i) => write!(f, "{i}"),
        }
    }
}

/// A validated column value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Structured content of a payload. Only ever built by the decoder, so the key and value are
/// known to match the target column types.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DecodedRecord {
    pub(crate) id: RecordKey,
    pub(crate) value: FieldValue,
}

/// One parameterized write, derived 1:1 from a [`DecodedRecord`]. The table and column names
/// belong to the sink, the command only carries the key and the values in column order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WriteCommand {
    pub(crate) key: RecordKey,
    pub(crate) values: Vec<FieldValue>,
}

impl From<DecodedRecord> for WriteCommand {
    fn from(record: DecodedRecord) -> Self {
        WriteCommand {
            key: record.id,
            values: vec![record.value],
        }
    }
}
