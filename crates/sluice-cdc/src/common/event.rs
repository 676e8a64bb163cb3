//! Change operations and output records
//!
//! [`OutputRecord`] is the boundary type handed to the outbound queue. It
//! mirrors the tuple a broker sink consumes: source partition, offset map,
//! topic, key/value with their schemas, and headers.

use crate::common::offset::{OffsetMap, SourcePartition};
use crate::common::CdcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Row inserted
    #[serde(rename = "c")]
    Create,
    /// Row updated
    #[serde(rename = "u")]
    Update,
    /// Row deleted
    #[serde(rename = "d")]
    Delete,
    /// Row read during a snapshot
    #[serde(rename = "r")]
    Read,
    /// Table truncated
    #[serde(rename = "t")]
    Truncate,
    /// Logical message
    #[serde(rename = "m")]
    Message,
}

impl Operation {
    /// Single-letter envelope code.
    pub fn code(&self) -> &'static str {
        match self {
            Operation::Create => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Read => "r",
            Operation::Truncate => "t",
            Operation::Message => "m",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Read => "READ",
            Operation::Truncate => "TRUNCATE",
            Operation::Message => "MESSAGE",
        };
        f.write_str(name)
    }
}

impl FromStr for Operation {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "create" => Ok(Operation::Create),
            "u" | "update" => Ok(Operation::Update),
            "d" | "delete" => Ok(Operation::Delete),
            "r" | "read" => Ok(Operation::Read),
            "t" | "truncate" => Ok(Operation::Truncate),
            "m" | "message" => Ok(Operation::Message),
            other => Err(CdcError::config(format!("Unknown operation '{}'", other))),
        }
    }
}

/// Lightweight structural schema attached to keys and values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Fully qualified schema name, e.g. `server.dbo.orders.Key`
    pub name: String,
    /// Field names in declaration order
    pub fields: Vec<String>,
    /// Whether a null value is acceptable
    pub optional: bool,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Check whether the schema declares a field.
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

/// Shared schema handle.
pub type SchemaRef = Arc<RecordSchema>;

/// Single record header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Value,
}

/// Ordered collection of record headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.push(Header {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Last value written for a key.
    pub fn last_with_name(&self, key: &str) -> Option<&Value> {
        self.0.iter().rev().find(|h| h.key == key).map(|h| &h.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Extend<Header> for Headers {
    fn extend<T: IntoIterator<Item = Header>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

/// Record handed to the outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Source partition key fields (offset storage key)
    pub source_partition: SourcePartition,
    /// Offset map reflecting the position of this record
    pub source_offset: OffsetMap,
    /// Destination topic
    pub topic: String,
    /// Fixed broker partition, if any
    pub kafka_partition: Option<i32>,
    pub key_schema: Option<SchemaRef>,
    pub key: Option<Value>,
    pub value_schema: Option<SchemaRef>,
    pub value: Option<Value>,
    /// Record timestamp in milliseconds since epoch
    pub timestamp: Option<i64>,
    pub headers: Headers,
}

impl OutputRecord {
    /// Build a tombstone for this record.
    ///
    /// Same topic, partition, key, timestamp and headers; null value and
    /// value schema.
    pub fn tombstone(&self) -> Self {
        Self {
            source_partition: self.source_partition.clone(),
            source_offset: self.source_offset.clone(),
            topic: self.topic.clone(),
            kafka_partition: self.kafka_partition,
            key_schema: self.key_schema.clone(),
            key: self.key.clone(),
            value_schema: None,
            value: None,
            timestamp: self.timestamp,
            headers: self.headers.clone(),
        }
    }

    /// Check if this record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none() && self.value_schema.is_none()
    }

    /// Envelope operation, when the value carries one.
    pub fn operation(&self) -> Option<Operation> {
        self.value
            .as_ref()
            .and_then(|v| v.get("op"))
            .and_then(Value::as_str)
            .and_then(|code| code.parse().ok())
    }

    /// `source.snapshot` marker of the envelope, when present.
    pub fn snapshot_marker(&self) -> Option<&str> {
        self.value
            .as_ref()
            .and_then(|v| v.get("source"))
            .and_then(|s| s.get("snapshot"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> OutputRecord {
        let mut headers = Headers::new();
        headers.add("trace", "abc");
        OutputRecord {
            source_partition: SourcePartition::from([("server".into(), "srv1".into())]),
            source_offset: OffsetMap::from([("commit_lsn".into(), json!("0000002a"))]),
            topic: "srv1.testdb.dbo.orders".into(),
            kafka_partition: None,
            key_schema: Some(Arc::new(RecordSchema::new("k", vec!["id".into()]))),
            key: Some(json!({"id": 1})),
            value_schema: Some(Arc::new(RecordSchema::new("v", vec!["op".into()]))),
            value: Some(json!({"op": "d", "source": {"snapshot": "false"}})),
            timestamp: Some(42),
            headers,
        }
    }

    #[test]
    fn test_operation_codes() {
        assert_eq!(Operation::Create.code(), "c");
        assert_eq!("u".parse::<Operation>().unwrap(), Operation::Update);
        assert_eq!("DELETE".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("x".parse::<Operation>().is_err());
        assert_eq!(
            serde_json::to_string(&Operation::Truncate).unwrap(),
            "\"t\""
        );
    }

    #[test]
    fn test_tombstone_shares_key_and_headers() {
        let delete = record();
        let tombstone = delete.tombstone();

        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.key, delete.key);
        assert_eq!(tombstone.key_schema, delete.key_schema);
        assert_eq!(tombstone.headers, delete.headers);
        assert_eq!(tombstone.topic, delete.topic);
        assert_eq!(tombstone.timestamp, delete.timestamp);
        assert!(!delete.is_tombstone());
    }

    #[test]
    fn test_envelope_accessors() {
        let rec = record();
        assert_eq!(rec.operation(), Some(Operation::Delete));
        assert_eq!(rec.snapshot_marker(), Some("false"));
        assert_eq!(rec.tombstone().operation(), None);
    }

    #[test]
    fn test_record_serde_keeps_schemas() {
        let rec = record();
        let encoded = serde_json::to_value(&rec).unwrap();
        assert_eq!(encoded["key_schema"]["fields"], json!(["id"]));
        assert_eq!(encoded["headers"][0]["key"], "trace");

        let decoded: OutputRecord = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, rec);
        assert_eq!(decoded.key_schema.unwrap().name, "k");
    }

    #[test]
    fn test_headers_last_with_name() {
        let mut headers = Headers::new();
        headers.add("a", 1).add("a", 2);
        assert_eq!(headers.last_with_name("a"), Some(&json!(2)));
        assert_eq!(headers.len(), 2);
        assert!(headers.last_with_name("b").is_none());
    }
}
