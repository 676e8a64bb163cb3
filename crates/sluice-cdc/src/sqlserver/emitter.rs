//! Change rows to change tuples
//!
//! An insert or delete row becomes one tuple. An update arrives as a
//! before/after image pair and becomes one update tuple, or a delete of the
//! old key followed by a create of the new key when the primary key changed.

use super::change_table::{ChangeRow, ChangeTable, RowOperation};
use super::error::SqlServerError;
use crate::common::{
    envelope, row_key, row_value, ChangeRecordEmitter, DataCollectionSchema, EmittedChange,
    Operation, Result, SharedOffsetContext, NEW_KEY_HEADER, OLD_KEY_HEADER,
};
use chrono::Utc;
use serde_json::{Map, Value};

/// Emitter for one change of a SQL Server change table.
pub struct SqlServerChangeRecordEmitter {
    offset: SharedOffsetContext,
    operation: Operation,
    columns: Vec<String>,
    before: Option<Vec<Value>>,
    after: Option<Vec<Value>>,
}

impl SqlServerChangeRecordEmitter {
    /// Build from a change row; an update-before row needs its after image.
    pub fn from_rows(
        offset: SharedOffsetContext,
        table: &ChangeTable,
        row: &ChangeRow,
        after_image: Option<&ChangeRow>,
    ) -> Result<Self> {
        let code = row
            .row_operation()
            .ok_or_else(|| SqlServerError::QueryFailed(format!("Unknown operation code {}", row.operation)))?;
        let (before, after) = match code {
            RowOperation::Insert => (None, Some(row.values.clone())),
            RowOperation::Delete => (Some(row.values.clone()), None),
            RowOperation::UpdateBefore => {
                let after = after_image
                    .filter(|a| a.row_operation() == Some(RowOperation::UpdateAfter))
                    .ok_or_else(|| SqlServerError::UnpairedUpdate(table.capture_instance.clone()))?;
                (Some(row.values.clone()), Some(after.values.clone()))
            }
            RowOperation::UpdateAfter => {
                return Err(SqlServerError::UnpairedUpdate(table.capture_instance.clone()).into())
            }
        };
        Ok(Self {
            offset,
            operation: code.operation(),
            columns: table.captured_columns.clone(),
            before,
            after,
        })
    }

    fn project(&self, schema: &DataCollectionSchema, values: &[Value]) -> Value {
        if self.columns.is_empty() {
            return row_value(schema, values);
        }
        let mut row = Map::new();
        for column in &schema.columns {
            let value = self
                .columns
                .iter()
                .position(|c| *c == column.name)
                .and_then(|i| values.get(i))
                .cloned()
                .unwrap_or(Value::Null);
            row.insert(column.name.clone(), value);
        }
        Value::Object(row)
    }
}

impl ChangeRecordEmitter for SqlServerChangeRecordEmitter {
    fn offset(&self) -> SharedOffsetContext {
        self.offset.clone()
    }

    fn operation(&self) -> Operation {
        self.operation
    }

    fn emit_change_records(&self, schema: &DataCollectionSchema) -> Result<Vec<EmittedChange>> {
        let source = self.offset.source_info();
        let ts_ms = Utc::now().timestamp_millis();
        let before = self.before.as_deref().map(|v| self.project(schema, v));
        let after = self.after.as_deref().map(|v| self.project(schema, v));

        let changes = match self.operation {
            Operation::Create => {
                let key = after.as_ref().and_then(|row| row_key(schema, row));
                vec![EmittedChange::new(
                    Operation::Create,
                    key,
                    envelope(None, after, source, Operation::Create, ts_ms),
                )]
            }
            Operation::Delete => {
                let key = before.as_ref().and_then(|row| row_key(schema, row));
                vec![EmittedChange::new(
                    Operation::Delete,
                    key,
                    envelope(before, None, source, Operation::Delete, ts_ms),
                )]
            }
            Operation::Update => {
                let old_key = before.as_ref().and_then(|row| row_key(schema, row));
                let new_key = after.as_ref().and_then(|row| row_key(schema, row));
                match (old_key, new_key) {
                    (Some(old_key), Some(new_key)) if old_key != new_key => vec![
                        EmittedChange::new(
                            Operation::Delete,
                            Some(old_key.clone()),
                            envelope(before, None, source.clone(), Operation::Delete, ts_ms),
                        )
                        .with_header(NEW_KEY_HEADER, new_key.clone()),
                        EmittedChange::new(
                            Operation::Create,
                            Some(new_key),
                            envelope(None, after, source, Operation::Create, ts_ms),
                        )
                        .with_header(OLD_KEY_HEADER, old_key),
                    ],
                    (_, key) => vec![EmittedChange::new(
                        Operation::Update,
                        key,
                        envelope(before, after, source, Operation::Update, ts_ms),
                    )],
                }
            }
            other => {
                return Err(SqlServerError::QueryFailed(format!(
                    "Unsupported change operation {}",
                    other
                ))
                .into())
            }
        };
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ColumnDefinition, TableId};
    use crate::sqlserver::lsn::Lsn;
    use crate::sqlserver::offset::SqlServerOffsetContext;
    use serde_json::json;
    use std::sync::Arc;

    fn lsn(n: u32) -> Lsn {
        Lsn::from_parts(0, n, 0)
    }

    fn table() -> ChangeTable {
        ChangeTable::new(
            TableId::new("testdb", "dbo", "orders"),
            "dbo_orders",
            1001,
            lsn(100),
            vec!["id".into(), "name".into()],
        )
    }

    fn schema() -> DataCollectionSchema {
        DataCollectionSchema::new(
            TableId::new("testdb", "dbo", "orders"),
            vec![
                ColumnDefinition::new("id", "int", 1).not_null(),
                ColumnDefinition::new("name", "nvarchar(50)", 2),
            ],
            vec!["id".into()],
        )
    }

    fn offset() -> SharedOffsetContext {
        Arc::new(SqlServerOffsetContext::new("srv1", "testdb"))
    }

    fn row(op: RowOperation, id: i64, name: &str) -> ChangeRow {
        ChangeRow::new(lsn(150), lsn(1), op, vec![json!(id), json!(name)])
    }

    #[test]
    fn test_insert_and_delete() {
        let insert = row(RowOperation::Insert, 1, "a");
        let emitter = SqlServerChangeRecordEmitter::from_rows(offset(), &table(), &insert, None).unwrap();
        let changes = emitter.emit_change_records(&schema()).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, Some(json!({"id": 1})));
        assert_eq!(changes[0].value["after"], json!({"id": 1, "name": "a"}));
        assert_eq!(changes[0].value["source"]["connector"], "sqlserver");

        let delete = row(RowOperation::Delete, 1, "a");
        let emitter = SqlServerChangeRecordEmitter::from_rows(offset(), &table(), &delete, None).unwrap();
        let changes = emitter.emit_change_records(&schema()).unwrap();
        assert_eq!(changes[0].operation, Operation::Delete);
        assert!(changes[0].value["after"].is_null());
    }

    #[test]
    fn test_update_in_place() {
        let before = row(RowOperation::UpdateBefore, 1, "a");
        let after = row(RowOperation::UpdateAfter, 1, "b");
        let emitter =
            SqlServerChangeRecordEmitter::from_rows(offset(), &table(), &before, Some(&after)).unwrap();
        let changes = emitter.emit_change_records(&schema()).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, Operation::Update);
        assert_eq!(changes[0].value["before"]["name"], "a");
        assert_eq!(changes[0].value["after"]["name"], "b");
    }

    #[test]
    fn test_key_change_splits() {
        let before = row(RowOperation::UpdateBefore, 1, "a");
        let after = row(RowOperation::UpdateAfter, 2, "a");
        let emitter =
            SqlServerChangeRecordEmitter::from_rows(offset(), &table(), &before, Some(&after)).unwrap();
        let changes = emitter.emit_change_records(&schema()).unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].operation, Operation::Delete);
        assert_eq!(changes[0].headers.last_with_name(NEW_KEY_HEADER), Some(&json!({"id": 2})));
        assert_eq!(changes[1].operation, Operation::Create);
        assert_eq!(changes[1].headers.last_with_name(OLD_KEY_HEADER), Some(&json!({"id": 1})));
    }

    #[test]
    fn test_unpaired_update_rejected() {
        let before = row(RowOperation::UpdateBefore, 1, "a");
        assert!(SqlServerChangeRecordEmitter::from_rows(offset(), &table(), &before, None).is_err());

        let after = row(RowOperation::UpdateAfter, 1, "a");
        assert!(SqlServerChangeRecordEmitter::from_rows(offset(), &table(), &after, None).is_err());
    }

    #[test]
    fn test_source_reflects_offset() {
        let context = SqlServerOffsetContext::new("srv1", "testdb");
        context.set_source(TableId::new("testdb", "dbo", "orders"), None);
        let shared: SharedOffsetContext = Arc::new(context);
        let insert = row(RowOperation::Insert, 1, "a");
        let emitter = SqlServerChangeRecordEmitter::from_rows(shared.clone(), &table(), &insert, None).unwrap();
        let changes = emitter.emit_change_records(&schema()).unwrap();
        assert_eq!(changes[0].value["source"], shared.source_info());
    }
}
