//! Change record emitters
//!
//! An emitter turns one source change into zero or more change tuples. A
//! primary-key update, for example, becomes a delete of the old key followed
//! by a create of the new one.

use crate::common::event::{Headers, Operation};
use crate::common::offset::SharedOffsetContext;
use crate::common::schema::DataCollectionSchema;
use crate::common::Result;
use serde_json::{json, Map, Value};

/// Header carrying the old key on the create half of a key change.
pub const OLD_KEY_HEADER: &str = "__debezium.oldkey";
/// Header carrying the new key on the delete half of a key change.
pub const NEW_KEY_HEADER: &str = "__debezium.newkey";

/// One (key, value, operation) tuple produced by an emitter.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedChange {
    pub operation: Operation,
    /// `None` for keyless tables
    pub key: Option<Value>,
    /// Envelope value
    pub value: Value,
    pub headers: Headers,
}

impl EmittedChange {
    pub fn new(operation: Operation, key: Option<Value>, value: Value) -> Self {
        Self {
            operation,
            key,
            value,
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.add(key, value);
        self
    }
}

/// Source-specific producer of change tuples.
pub trait ChangeRecordEmitter: Send + Sync {
    /// Offset context at the position of this change.
    fn offset(&self) -> SharedOffsetContext;

    /// Operation of the source change.
    fn operation(&self) -> Operation;

    /// Whether the change should be treated as filtered.
    fn ignore_record(&self) -> bool {
        false
    }

    /// Produce the change tuples against the collection's current schema.
    fn emit_change_records(&self, schema: &DataCollectionSchema) -> Result<Vec<EmittedChange>>;
}

/// Build a change envelope.
pub fn envelope(
    before: Option<Value>,
    after: Option<Value>,
    source: Value,
    operation: Operation,
    ts_ms: i64,
) -> Value {
    json!({
        "before": before.unwrap_or(Value::Null),
        "after": after.unwrap_or(Value::Null),
        "source": source,
        "op": operation.code(),
        "ts_ms": ts_ms,
    })
}

/// Build a row object from positional values.
///
/// Missing trailing values become null.
pub fn row_value(schema: &DataCollectionSchema, values: &[Value]) -> Value {
    let mut row = Map::new();
    for (i, column) in schema.columns.iter().enumerate() {
        row.insert(
            column.name.clone(),
            values.get(i).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(row)
}

/// Extract the key object from a row, `None` for keyless tables.
pub fn row_key(schema: &DataCollectionSchema, row: &Value) -> Option<Value> {
    if schema.key_columns.is_empty() {
        return None;
    }
    let mut key = Map::new();
    for column in &schema.key_columns {
        key.insert(
            column.clone(),
            row.get(column).cloned().unwrap_or(Value::Null),
        );
    }
    Some(Value::Object(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::schema::{ColumnDefinition, TableId};

    fn schema(keys: Vec<String>) -> DataCollectionSchema {
        DataCollectionSchema::new(
            TableId::new("testdb", "dbo", "orders"),
            vec![
                ColumnDefinition::new("id", "int", 1),
                ColumnDefinition::new("name", "nvarchar(10)", 2),
            ],
            keys,
        )
    }

    #[test]
    fn test_row_and_key() {
        let schema = schema(vec!["id".into()]);
        let row = row_value(&schema, &[json!(7)]);
        assert_eq!(row, json!({"id": 7, "name": null}));
        assert_eq!(row_key(&schema, &row), Some(json!({"id": 7})));

        let keyless = self::schema(vec![]);
        assert_eq!(row_key(&keyless, &row), None);
    }

    #[test]
    fn test_envelope_shape() {
        let value = envelope(None, Some(json!({"id": 1})), json!({"db": "testdb"}), Operation::Create, 5);
        assert_eq!(value["op"], "c");
        assert!(value["before"].is_null());
        assert_eq!(value["after"]["id"], 1);
        assert_eq!(value["ts_ms"], 5);
    }
}
