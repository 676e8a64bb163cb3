//! # Schema Change Events
//!
//! DDL observed in the source database, routed by the dispatcher to the
//! historized schema store and, when schema-change history is enabled, to the
//! schema change topic as a record keyed by database name.
//!
//! ## Record Format
//!
//! ```json
//! {
//!   "source": { "...": "..." },
//!   "ts_ms": 1705123456789,
//!   "databaseName": "testdb",
//!   "schemaName": "dbo",
//!   "ddl": "ALTER TABLE dbo.orders ADD total DECIMAL(10,2)",
//!   "tableChanges": [
//!     {"type": "ALTER", "id": "testdb.dbo.orders", "table": {"primaryKeyColumnNames": ["id"], "columns": []}}
//!   ]
//! }
//! ```

use crate::common::offset::{OffsetMap, SourcePartition};
use crate::common::schema::{ColumnDefinition, TableId};
use crate::common::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Schema Change Types
// ============================================================================

/// Type of schema change (DDL operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaChangeType {
    /// CREATE TABLE
    Create,
    /// ALTER TABLE (add/drop/modify column)
    Alter,
    /// DROP TABLE
    Drop,
    /// Database-level DDL without table changes
    Database,
}

impl SchemaChangeType {
    /// Parse DDL type from SQL statement.
    pub fn from_sql(sql: &str) -> Self {
        let upper = sql.trim().to_uppercase();

        if upper.starts_with("CREATE TABLE") {
            SchemaChangeType::Create
        } else if upper.starts_with("ALTER TABLE") {
            SchemaChangeType::Alter
        } else if upper.starts_with("DROP TABLE") {
            SchemaChangeType::Drop
        } else {
            SchemaChangeType::Database
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaChangeType::Create => "CREATE",
            SchemaChangeType::Alter => "ALTER",
            SchemaChangeType::Drop => "DROP",
            SchemaChangeType::Database => "DATABASE",
        }
    }
}

impl std::fmt::Display for SchemaChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Table Changes
// ============================================================================

/// Structural change to one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub change_type: SchemaChangeType,
    pub id: TableId,
    /// Full column list after the change (empty for drops)
    pub columns: Vec<ColumnDefinition>,
    pub key_columns: Vec<String>,
}

impl TableChange {
    pub fn create(id: TableId, columns: Vec<ColumnDefinition>, key_columns: Vec<String>) -> Self {
        Self {
            change_type: SchemaChangeType::Create,
            id,
            columns,
            key_columns,
        }
    }

    pub fn alter(id: TableId, columns: Vec<ColumnDefinition>, key_columns: Vec<String>) -> Self {
        Self {
            change_type: SchemaChangeType::Alter,
            ..Self::create(id, columns, key_columns)
        }
    }

    pub fn drop(id: TableId) -> Self {
        Self {
            change_type: SchemaChangeType::Drop,
            id,
            columns: Vec::new(),
            key_columns: Vec::new(),
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "type": self.change_type.as_str(),
            "id": self.id.to_string(),
            "table": {
                "primaryKeyColumnNames": self.key_columns,
                "columns": self.columns.iter().map(|c| json!({
                    "name": c.name,
                    "typeName": c.type_name,
                    "position": c.position,
                    "optional": c.nullable,
                })).collect::<Vec<_>>(),
            },
        })
    }
}

// ============================================================================
// Schema Change Event
// ============================================================================

/// Schema change observed at a position in the source log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChangeEvent {
    pub source_partition: SourcePartition,
    pub source_offset: OffsetMap,
    /// Envelope `source` block at the time of the change
    pub source: Value,
    pub database: String,
    pub schema: Option<String>,
    pub ddl: Option<String>,
    pub change_type: SchemaChangeType,
    pub table_changes: Vec<TableChange>,
    pub timestamp: DateTime<Utc>,
}

impl SchemaChangeEvent {
    pub fn new(database: impl Into<String>, change_type: SchemaChangeType) -> Self {
        Self {
            source_partition: SourcePartition::new(),
            source_offset: OffsetMap::new(),
            source: Value::Null,
            database: database.into(),
            schema: None,
            ddl: None,
            change_type,
            table_changes: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_position(mut self, partition: SourcePartition, offset: OffsetMap) -> Self {
        self.source_partition = partition;
        self.source_offset = offset;
        self
    }

    pub fn with_source(mut self, source: Value) -> Self {
        self.source = source;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_ddl(mut self, ddl: impl Into<String>) -> Self {
        self.ddl = Some(ddl.into());
        self
    }

    pub fn with_table_change(mut self, change: TableChange) -> Self {
        self.table_changes.push(change);
        self
    }

    /// Tables touched by this change.
    pub fn table_ids(&self) -> Vec<&TableId> {
        self.table_changes.iter().map(|c| &c.id).collect()
    }

    /// Record key: the database name.
    pub fn record_key(&self) -> Value {
        json!({ "databaseName": self.database })
    }

    /// Record value in the schema change topic format.
    pub fn record_value(&self) -> Value {
        json!({
            "source": self.source,
            "ts_ms": self.timestamp.timestamp_millis(),
            "databaseName": self.database,
            "schemaName": self.schema,
            "ddl": self.ddl,
            "tableChanges": self.table_changes.iter().map(TableChange::to_value).collect::<Vec<_>>(),
        })
    }
}

/// Source of schema change events handed to the dispatcher.
pub trait SchemaChangeEventEmitter: Send + Sync {
    fn emit_schema_change_events(&self) -> Result<Vec<SchemaChangeEvent>>;
}

impl SchemaChangeEventEmitter for SchemaChangeEvent {
    fn emit_schema_change_events(&self) -> Result<Vec<SchemaChangeEvent>> {
        Ok(vec![self.clone()])
    }
}

impl SchemaChangeEventEmitter for Vec<SchemaChangeEvent> {
    fn emit_schema_change_events(&self) -> Result<Vec<SchemaChangeEvent>> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_from_sql() {
        assert_eq!(
            SchemaChangeType::from_sql("  create table dbo.t (id int)"),
            SchemaChangeType::Create
        );
        assert_eq!(
            SchemaChangeType::from_sql("ALTER TABLE dbo.t ADD x INT"),
            SchemaChangeType::Alter
        );
        assert_eq!(
            SchemaChangeType::from_sql("DROP TABLE dbo.t"),
            SchemaChangeType::Drop
        );
        assert_eq!(
            SchemaChangeType::from_sql("GRANT SELECT ON dbo.t TO bob"),
            SchemaChangeType::Database
        );
    }

    #[test]
    fn test_record_key_and_value() {
        let id = TableId::new("testdb", "dbo", "orders");
        let event = SchemaChangeEvent::new("testdb", SchemaChangeType::Create)
            .with_schema("dbo")
            .with_ddl("CREATE TABLE dbo.orders (id INT PRIMARY KEY)")
            .with_table_change(TableChange::create(
                id,
                vec![ColumnDefinition::new("id", "int", 1).not_null()],
                vec!["id".into()],
            ));

        assert_eq!(event.record_key(), json!({"databaseName": "testdb"}));

        let value = event.record_value();
        assert_eq!(value["databaseName"], "testdb");
        assert_eq!(value["schemaName"], "dbo");
        assert_eq!(value["tableChanges"][0]["type"], "CREATE");
        assert_eq!(value["tableChanges"][0]["id"], "testdb.dbo.orders");
        assert_eq!(
            value["tableChanges"][0]["table"]["primaryKeyColumnNames"][0],
            "id"
        );
    }

    #[test]
    fn test_emitter_impls() {
        let event = SchemaChangeEvent::new("testdb", SchemaChangeType::Database);
        assert_eq!(event.emit_schema_change_events().unwrap().len(), 1);
        let batch = vec![event.clone(), event];
        assert_eq!(batch.emit_schema_change_events().unwrap().len(), 2);
    }
}
