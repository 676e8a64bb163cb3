//! Change tables and change rows
//!
//! A capture instance records row changes of one source table into
//! `cdc.<capture_instance>_CT`. Each row carries the commit LSN
//! (`__$start_lsn`), the in-transaction sequence (`__$seqval`) and an
//! operation code (`__$operation`):
//!
//! | Code | Meaning |
//! |------|---------|
//! | 1 | delete |
//! | 2 | insert |
//! | 3 | update, before image |
//! | 4 | update, after image |

use super::lsn::{Lsn, TxLogPosition};
use crate::common::{Operation, TableId};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Operation codes
// ============================================================================

/// `__$operation` code of a change row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowOperation {
    Delete = 1,
    Insert = 2,
    UpdateBefore = 3,
    UpdateAfter = 4,
}

impl RowOperation {
    pub fn rank(self) -> i32 {
        self as i32
    }

    pub fn from_rank(rank: i32) -> Option<Self> {
        match rank {
            1 => Some(RowOperation::Delete),
            2 => Some(RowOperation::Insert),
            3 => Some(RowOperation::UpdateBefore),
            4 => Some(RowOperation::UpdateAfter),
            _ => None,
        }
    }

    /// Envelope operation for this code.
    pub fn operation(self) -> Operation {
        match self {
            RowOperation::Delete => Operation::Delete,
            RowOperation::Insert => Operation::Create,
            RowOperation::UpdateBefore | RowOperation::UpdateAfter => Operation::Update,
        }
    }

    /// Codes recording an envelope operation. Update maps to both images.
    pub fn ranks_for(operation: Operation) -> &'static [i32] {
        match operation {
            Operation::Create => &[2],
            Operation::Update => &[3, 4],
            Operation::Delete => &[1],
            Operation::Read | Operation::Truncate | Operation::Message => &[],
        }
    }

    /// Codes to exclude for a set of skipped operations.
    pub fn excluded_ranks<'a>(skipped: impl IntoIterator<Item = &'a Operation>) -> BTreeSet<i32> {
        skipped
            .into_iter()
            .flat_map(|op| Self::ranks_for(*op).iter().copied())
            .collect()
    }
}

// ============================================================================
// Change table
// ============================================================================

/// One capture instance of a source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTable {
    pub source_table: TableId,
    pub capture_instance: String,
    /// Object id of the change table itself
    pub change_table_object_id: i32,
    /// First LSN captured by this instance
    pub start_lsn: Lsn,
    /// Start LSN of the instance replacing this one, NULL while current
    pub stop_lsn: Lsn,
    /// Captured column names, by column ordinal
    pub captured_columns: Vec<String>,
}

impl ChangeTable {
    pub fn new(
        source_table: TableId,
        capture_instance: impl Into<String>,
        change_table_object_id: i32,
        start_lsn: Lsn,
        captured_columns: Vec<String>,
    ) -> Self {
        Self {
            source_table,
            capture_instance: capture_instance.into(),
            change_table_object_id,
            start_lsn,
            stop_lsn: Lsn::NULL,
            captured_columns,
        }
    }

    /// Name of the table holding the captured rows.
    pub fn change_table_name(&self) -> String {
        change_table_name(&self.capture_instance)
    }

    /// Whether a change at `lsn` belongs to this instance's capture window.
    pub fn covers(&self, lsn: &Lsn) -> bool {
        !self.stop_lsn.is_available() || *lsn < self.stop_lsn
    }

    /// Zip captured column names with positional values.
    pub fn row_object(&self, values: &[Value]) -> Value {
        let mut row = Map::new();
        for (i, column) in self.captured_columns.iter().enumerate() {
            row.insert(column.clone(), values.get(i).cloned().unwrap_or(Value::Null));
        }
        Value::Object(row)
    }
}

impl fmt::Display for ChangeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Capture instance \"{}\" [sourceTableId={}, changeTableId={}, startLsn={}, changeTableObjectId={}, stopLsn={}]",
            self.capture_instance,
            self.source_table,
            self.change_table_name(),
            self.start_lsn,
            self.change_table_object_id,
            self.stop_lsn
        )
    }
}

/// `<capture_instance>_CT`.
pub fn change_table_name(capture_instance: &str) -> String {
    format!("{}_CT", capture_instance)
}

/// Raw row of `cdc.change_tables`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTableEntry {
    pub database: String,
    pub source_schema: String,
    pub source_table: String,
    pub capture_instance: String,
    pub object_id: i32,
    pub source_object_id: i32,
    pub start_lsn: Lsn,
    pub create_date: DateTime<Utc>,
}

impl ChangeTableEntry {
    pub fn source_table_id(&self) -> TableId {
        TableId::new(&self.database, &self.source_schema, &self.source_table)
    }
}

/// Raw row of `cdc.captured_columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedColumn {
    pub object_id: i32,
    pub column_name: String,
    pub column_id: i32,
}

// ============================================================================
// Change row
// ============================================================================

/// One row of a change table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    /// `__$start_lsn`
    pub commit_lsn: Lsn,
    /// `__$seqval`
    pub seqval: Lsn,
    /// `__$operation`
    pub operation: i32,
    pub update_mask: Vec<u8>,
    /// `__$command_id`, 0 when not selected
    pub command_id: i32,
    pub commit_time: Option<DateTime<Utc>>,
    /// Captured column values, by column ordinal
    pub values: Vec<Value>,
}

impl ChangeRow {
    pub fn new(commit_lsn: Lsn, seqval: Lsn, operation: RowOperation, values: Vec<Value>) -> Self {
        Self {
            commit_lsn,
            seqval,
            operation: operation.rank(),
            update_mask: Vec::new(),
            command_id: 0,
            commit_time: None,
            values,
        }
    }

    pub fn with_commit_time(mut self, time: DateTime<Utc>) -> Self {
        self.commit_time = Some(time);
        self
    }

    pub fn with_command_id(mut self, command_id: i32) -> Self {
        self.command_id = command_id;
        self
    }

    pub fn row_operation(&self) -> Option<RowOperation> {
        RowOperation::from_rank(self.operation)
    }

    pub fn position(&self) -> TxLogPosition {
        TxLogPosition::new(self.commit_lsn, self.seqval)
    }

    /// Global ordering key: (position, sequence, operation).
    pub fn order_key(&self) -> (Lsn, Lsn, i32) {
        (self.commit_lsn, self.seqval, self.operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_excluded_ranks() {
        let ranks = RowOperation::excluded_ranks(&[Operation::Update, Operation::Truncate]);
        assert_eq!(ranks.into_iter().collect::<Vec<_>>(), vec![3, 4]);

        let ranks = RowOperation::excluded_ranks(&[Operation::Create, Operation::Delete]);
        assert_eq!(ranks.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_operation_codes() {
        assert_eq!(RowOperation::from_rank(3), Some(RowOperation::UpdateBefore));
        assert_eq!(RowOperation::from_rank(5), None);
        assert_eq!(RowOperation::Insert.operation(), Operation::Create);
        assert_eq!(RowOperation::UpdateAfter.operation(), Operation::Update);
    }

    #[test]
    fn test_change_table_names_and_rows() {
        let mut table = ChangeTable::new(
            TableId::new("testdb", "dbo", "orders"),
            "dbo_orders",
            1001,
            Lsn::from_parts(0, 100, 0),
            vec!["id".into(), "name".into()],
        );
        assert_eq!(table.change_table_name(), "dbo_orders_CT");
        assert_eq!(table.row_object(&[json!(1)]), json!({"id": 1, "name": null}));

        assert!(table.covers(&Lsn::from_parts(0, 500, 0)));
        table.stop_lsn = Lsn::from_parts(0, 200, 0);
        assert!(table.covers(&Lsn::from_parts(0, 199, 0)));
        assert!(!table.covers(&Lsn::from_parts(0, 200, 0)));
    }
}
