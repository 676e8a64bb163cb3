//! Data collection identity and schema store
//!
//! [`DatabaseSchema`] is the lookup boundary used by the dispatcher
//! (`schema_for`). [`HistorizedSchema`] is the in-process store that keeps
//! every prior version of a table's structure and applies schema-change
//! events so later lookups reflect them.

use crate::common::config::ConnectorConfig;
use crate::common::event::{RecordSchema, SchemaRef};
use crate::common::schema_change::{SchemaChangeEvent, SchemaChangeType};
use crate::common::{CdcError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Fields of every change envelope.
pub const ENVELOPE_FIELDS: [&str; 6] = ["before", "after", "source", "op", "ts_ms", "transaction"];

/// Fully qualified table identity: `catalog.schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(
        catalog: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            catalog: catalog.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `schema.table` without the catalog.
    pub fn schema_qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

impl FromStr for TableId {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [catalog, schema, table] if !table.is_empty() => {
                Ok(TableId::new(*catalog, *schema, *table))
            }
            _ => Err(CdcError::config(format!(
                "Invalid table identifier '{}', expected catalog.schema.table",
                s
            ))),
        }
    }
}

/// Column definition of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,
    /// Database-native type (e.g., "nvarchar(255)", "int")
    pub type_name: String,
    /// Column position (1-indexed)
    pub position: u32,
    /// Is nullable
    pub nullable: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, position: u32) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            position,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Current structure of one data collection.
#[derive(Debug, Clone, PartialEq)]
pub struct DataCollectionSchema {
    pub id: TableId,
    pub columns: Vec<ColumnDefinition>,
    /// Primary key (or unique index) column names
    pub key_columns: Vec<String>,
    /// `None` for keyless tables
    pub key_schema: Option<SchemaRef>,
    pub envelope_schema: SchemaRef,
    /// Monotonic version, starting at 1
    pub version: u32,
}

impl DataCollectionSchema {
    pub fn new(id: TableId, columns: Vec<ColumnDefinition>, key_columns: Vec<String>) -> Self {
        let key_schema = if key_columns.is_empty() {
            None
        } else {
            Some(Arc::new(RecordSchema::new(
                format!("{}.Key", id),
                key_columns.clone(),
            )))
        };
        let envelope_schema = Arc::new(RecordSchema::new(
            format!("{}.Envelope", id),
            ENVELOPE_FIELDS.iter().map(|f| f.to_string()).collect(),
        ));

        Self {
            id,
            columns,
            key_columns,
            key_schema,
            envelope_schema,
            version: 1,
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// Schema lookup used by the dispatcher.
pub trait DatabaseSchema: Send + Sync {
    /// Current schema for a collection, if known.
    fn schema_for(&self, id: &TableId) -> Option<Arc<DataCollectionSchema>>;

    /// Whether this store records schema history.
    fn is_historized(&self) -> bool {
        false
    }

    /// Whether only captured tables' history is kept.
    fn store_only_captured_tables(&self) -> bool {
        true
    }

    /// Apply a schema change so that later lookups reflect it.
    fn apply_schema_change(&self, _event: &SchemaChangeEvent) -> Result<()> {
        Ok(())
    }
}

/// In-process historized schema store.
///
/// Keeps every version of every table and the ordered list of applied
/// schema-change events.
#[derive(Debug)]
pub struct HistorizedSchema {
    versions: RwLock<HashMap<TableId, Vec<Arc<DataCollectionSchema>>>>,
    dropped: RwLock<HashSet<TableId>>,
    history: RwLock<Vec<SchemaChangeEvent>>,
    store_only_captured_tables: bool,
}

impl HistorizedSchema {
    pub fn new() -> Self {
        Self {
            versions: RwLock::new(HashMap::new()),
            dropped: RwLock::new(HashSet::new()),
            history: RwLock::new(Vec::new()),
            store_only_captured_tables: false,
        }
    }

    /// Store configured from `store_only_captured_tables_ddl`.
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new().storing_only_captured_tables(config.store_only_captured_tables_ddl)
    }

    /// Restrict history to captured tables.
    pub fn storing_only_captured_tables(mut self, only_captured: bool) -> Self {
        self.store_only_captured_tables = only_captured;
        self
    }

    /// Register an initial schema without recording history.
    pub fn register(&self, schema: DataCollectionSchema) {
        let id = schema.id.clone();
        {
            let mut versions = self.versions.write();
            let entry = versions.entry(id.clone()).or_default();
            let version = entry.last().map(|s| s.version + 1).unwrap_or(1);
            entry.push(Arc::new(schema.with_version(version)));
        }
        self.dropped.write().remove(&id);
    }

    /// All known versions of a table, oldest first.
    pub fn versions(&self, id: &TableId) -> Vec<Arc<DataCollectionSchema>> {
        self.versions.read().get(id).cloned().unwrap_or_default()
    }

    /// Applied schema-change events, oldest first.
    pub fn history(&self) -> Vec<SchemaChangeEvent> {
        self.history.read().clone()
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        let dropped = self.dropped.read();
        let mut ids: Vec<TableId> = self
            .versions
            .read()
            .keys()
            .filter(|id| !dropped.contains(*id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl Default for HistorizedSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseSchema for HistorizedSchema {
    fn schema_for(&self, id: &TableId) -> Option<Arc<DataCollectionSchema>> {
        if self.dropped.read().contains(id) {
            return None;
        }
        self.versions.read().get(id).and_then(|v| v.last().cloned())
    }

    fn is_historized(&self) -> bool {
        true
    }

    fn store_only_captured_tables(&self) -> bool {
        self.store_only_captured_tables
    }

    fn apply_schema_change(&self, event: &SchemaChangeEvent) -> Result<()> {
        for change in &event.table_changes {
            match change.change_type {
                SchemaChangeType::Create | SchemaChangeType::Alter => {
                    trace!(table = %change.id, change = ?change.change_type, "Applying table change");
                    self.register(DataCollectionSchema::new(
                        change.id.clone(),
                        change.columns.clone(),
                        change.key_columns.clone(),
                    ));
                }
                SchemaChangeType::Drop => {
                    if !self.versions.read().contains_key(&change.id) {
                        return Err(CdcError::schema(format!(
                            "Cannot drop unknown table {}",
                            change.id
                        )));
                    }
                    self.dropped.write().insert(change.id.clone());
                }
                SchemaChangeType::Database => {}
            }
        }

        self.history.write().push(event.clone());
        debug!(
            database = %event.database,
            changes = event.table_changes.len(),
            "Schema change applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::schema_change::TableChange;

    fn orders() -> TableId {
        TableId::new("testdb", "dbo", "orders")
    }

    fn columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "int", 1).not_null(),
            ColumnDefinition::new("name", "nvarchar(100)", 2),
        ]
    }

    #[test]
    fn test_table_id_parse_and_display() {
        let id: TableId = "testdb.dbo.orders".parse().unwrap();
        assert_eq!(id, orders());
        assert_eq!(id.to_string(), "testdb.dbo.orders");
        assert_eq!(id.schema_qualified(), "dbo.orders");
        assert!("dbo.orders".parse::<TableId>().is_err());
    }

    #[test]
    fn test_keyless_table_has_no_key_schema() {
        let schema = DataCollectionSchema::new(orders(), columns(), vec![]);
        assert!(schema.key_schema.is_none());
        assert!(schema.envelope_schema.has_field("after"));

        let keyed = DataCollectionSchema::new(orders(), columns(), vec!["id".into()]);
        let key = keyed.key_schema.unwrap();
        assert_eq!(key.name, "testdb.dbo.orders.Key");
        assert_eq!(key.fields, vec!["id".to_string()]);
    }

    #[test]
    fn test_historized_schema_keeps_versions() {
        let store = HistorizedSchema::new();
        store.register(DataCollectionSchema::new(orders(), columns(), vec!["id".into()]));

        let mut altered = columns();
        altered.push(ColumnDefinition::new("total", "decimal(10,2)", 3));
        let event = SchemaChangeEvent::new("testdb", SchemaChangeType::Alter)
            .with_table_change(TableChange::alter(orders(), altered, vec!["id".into()]));
        store.apply_schema_change(&event).unwrap();

        let current = store.schema_for(&orders()).unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.columns.len(), 3);
        assert_eq!(store.versions(&orders()).len(), 2);
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn test_drop_hides_table_but_keeps_history() {
        let store = HistorizedSchema::new();
        store.register(DataCollectionSchema::new(orders(), columns(), vec![]));

        let drop = SchemaChangeEvent::new("testdb", SchemaChangeType::Drop)
            .with_table_change(TableChange::drop(orders()));
        store.apply_schema_change(&drop).unwrap();

        assert!(store.schema_for(&orders()).is_none());
        assert_eq!(store.versions(&orders()).len(), 1);
        assert!(store.table_ids().is_empty());

        let unknown = SchemaChangeEvent::new("testdb", SchemaChangeType::Drop)
            .with_table_change(TableChange::drop(TableId::new("testdb", "dbo", "nope")));
        assert!(store.apply_schema_change(&unknown).is_err());
    }
}
