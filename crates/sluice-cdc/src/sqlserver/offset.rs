//! SQL Server partition and offset context
//!
//! Offsets are stored per `{server, database}` partition:
//!
//! | Key | Value |
//! |-----|-------|
//! | `commit_lsn` | commit LSN of the last processed change |
//! | `change_lsn` | `__$seqval` of the last processed change |
//! | `operation` | `__$operation` of the last processed change |
//! | `event_serial_no` | events emitted at the same change position |
//! | `snapshot` / `snapshot_completed` | snapshot progress |

use super::lsn::{Lsn, TxLogPosition};
use crate::common::{
    CdcError, OffsetContext, OffsetMap, Partition, Result, SharedOffsetContext, SnapshotRecord,
    SourcePartition, TableId,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;

pub const SERVER_PARTITION_KEY: &str = "server";
pub const DATABASE_PARTITION_KEY: &str = "database";

pub const COMMIT_LSN_KEY: &str = "commit_lsn";
pub const CHANGE_LSN_KEY: &str = "change_lsn";
pub const OPERATION_KEY: &str = "operation";
pub const EVENT_SERIAL_NO_KEY: &str = "event_serial_no";
pub const SNAPSHOT_KEY: &str = "snapshot";
pub const SNAPSHOT_COMPLETED_KEY: &str = "snapshot_completed";

// ============================================================================
// Partition
// ============================================================================

/// One captured database of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlServerPartition {
    server: String,
    database: String,
}

impl SqlServerPartition {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }
}

impl Partition for SqlServerPartition {
    fn source_partition(&self) -> SourcePartition {
        SourcePartition::from([
            (SERVER_PARTITION_KEY.to_string(), self.server.clone()),
            (DATABASE_PARTITION_KEY.to_string(), self.database.clone()),
        ])
    }
}

// ============================================================================
// Offset context
// ============================================================================

#[derive(Debug, Clone, Default)]
struct PositionState {
    position: TxLogPosition,
    operation: i32,
    event_serial_no: i64,
    table: Option<TableId>,
    source_time: Option<DateTime<Utc>>,
    snapshot: Option<SnapshotRecord>,
    snapshot_completed: bool,
}

/// Progress of one SQL Server partition.
#[derive(Debug)]
pub struct SqlServerOffsetContext {
    server: String,
    database: String,
    state: RwLock<PositionState>,
}

impl SqlServerOffsetContext {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            state: RwLock::new(PositionState::default()),
        }
    }

    /// Restore from a stored offset map.
    pub fn from_offset(partition: &SqlServerPartition, offset: &OffsetMap) -> Result<Self> {
        let lsn = |key: &str| -> Result<Lsn> {
            match offset.get(key) {
                None | Some(Value::Null) => Ok(Lsn::NULL),
                Some(Value::String(s)) => Ok(s.parse::<Lsn>()?),
                Some(other) => Err(CdcError::invalid_state(format!(
                    "Offset field '{}' is not a string: {}",
                    key, other
                ))),
            }
        };
        let position = TxLogPosition::new(lsn(COMMIT_LSN_KEY)?, lsn(CHANGE_LSN_KEY)?);
        let int = |key: &str| offset.get(key).and_then(Value::as_i64).unwrap_or(0);
        let flag = |key: &str| offset.get(key).and_then(Value::as_bool).unwrap_or(false);

        let snapshot_running = flag(SNAPSHOT_KEY);
        let state = PositionState {
            position,
            operation: int(OPERATION_KEY) as i32,
            event_serial_no: int(EVENT_SERIAL_NO_KEY),
            snapshot: snapshot_running.then_some(SnapshotRecord::True),
            snapshot_completed: flag(SNAPSHOT_COMPLETED_KEY),
            ..Default::default()
        };
        Ok(Self {
            server: partition.server_name().to_string(),
            database: partition.database_name().to_string(),
            state: RwLock::new(state),
        })
    }

    pub fn position(&self) -> TxLogPosition {
        self.state.read().position
    }

    /// `__$operation` of the last processed change.
    pub fn operation(&self) -> i32 {
        self.state.read().operation
    }

    pub fn event_serial_no(&self) -> i64 {
        self.state.read().event_serial_no
    }

    pub fn set_position(&self, position: TxLogPosition, operation: i32, event_serial_no: i64) {
        let mut state = self.state.write();
        state.position = position;
        state.operation = operation;
        state.event_serial_no = event_serial_no;
    }

    /// Table and commit time reported in the `source` block.
    pub fn set_source(&self, table: TableId, source_time: Option<DateTime<Utc>>) {
        let mut state = self.state.write();
        state.table = Some(table);
        state.source_time = source_time;
    }

    /// Detached copy positioned at one change, for the records it produces.
    pub fn at_change(
        &self,
        position: TxLogPosition,
        operation: i32,
        event_serial_no: i64,
        table: &TableId,
        source_time: Option<DateTime<Utc>>,
    ) -> Arc<SqlServerOffsetContext> {
        let mut state = self.state.read().clone();
        state.position = position;
        state.operation = operation;
        state.event_serial_no = event_serial_no;
        state.table = Some(table.clone());
        state.source_time = source_time;
        Arc::new(Self {
            server: self.server.clone(),
            database: self.database.clone(),
            state: RwLock::new(state),
        })
    }

    /// Take over the position of a detached copy once its records are queued.
    pub fn advance_to(&self, other: &SqlServerOffsetContext) {
        let next = other.state.read().clone();
        *self.state.write() = next;
    }

    pub fn start_snapshot(&self) {
        let mut state = self.state.write();
        state.snapshot = Some(SnapshotRecord::True);
        state.snapshot_completed = false;
    }

    pub fn is_snapshot_completed(&self) -> bool {
        self.state.read().snapshot_completed
    }

    pub fn shared(self) -> SharedOffsetContext {
        Arc::new(self)
    }
}

impl OffsetContext for SqlServerOffsetContext {
    fn offset(&self) -> OffsetMap {
        let state = self.state.read();
        let mut offset = OffsetMap::new();
        if state.position.commit_lsn.is_available() {
            offset.insert(
                COMMIT_LSN_KEY.to_string(),
                json!(state.position.commit_lsn.to_string()),
            );
        }

        if state.snapshot.is_some() && !state.snapshot_completed {
            offset.insert(SNAPSHOT_KEY.to_string(), json!(true));
            offset.insert(SNAPSHOT_COMPLETED_KEY.to_string(), json!(false));
            return offset;
        }

        if state.position.change_lsn.is_available() {
            offset.insert(
                CHANGE_LSN_KEY.to_string(),
                json!(state.position.change_lsn.to_string()),
            );
            offset.insert(OPERATION_KEY.to_string(), json!(state.operation));
        }
        offset.insert(
            EVENT_SERIAL_NO_KEY.to_string(),
            json!(state.event_serial_no),
        );
        if state.snapshot_completed {
            offset.insert(SNAPSHOT_COMPLETED_KEY.to_string(), json!(true));
        }
        offset
    }

    fn source_info(&self) -> Value {
        let state = self.state.read();
        let marker = match (state.snapshot, state.snapshot_completed) {
            (Some(record), false) => record.as_str(),
            _ => SnapshotRecord::False.as_str(),
        };
        let lsn_value = |lsn: &Lsn| {
            if lsn.is_available() {
                json!(lsn.to_string())
            } else {
                Value::Null
            }
        };
        json!({
            "connector": "sqlserver",
            "name": self.server,
            "ts_ms": state.source_time.map(|t| t.timestamp_millis()).unwrap_or(0),
            "snapshot": marker,
            "db": self.database,
            "schema": state.table.as_ref().map(|t| t.schema.clone()),
            "table": state.table.as_ref().map(|t| t.table.clone()),
            "change_lsn": lsn_value(&state.position.change_lsn),
            "commit_lsn": lsn_value(&state.position.commit_lsn),
            "event_serial_no": state.event_serial_no,
        })
    }

    fn is_snapshot_running(&self) -> bool {
        let state = self.state.read();
        state.snapshot.is_some() && !state.snapshot_completed
    }

    fn mark_snapshot_record(&self, record: SnapshotRecord) {
        self.state.write().snapshot = Some(record);
    }

    fn pre_snapshot_completion(&self) {
        self.state.write().snapshot_completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lsn(n: u32) -> Lsn {
        Lsn::from_parts(0, n, 0)
    }

    #[test]
    fn test_partition_keys() {
        let partition = SqlServerPartition::new("srv1", "testdb");
        assert_eq!(partition.id(), "testdb/srv1");
        assert_eq!(partition.source_partition()["server"], "srv1");
    }

    #[test]
    fn test_streaming_offset_restores() {
        let partition = SqlServerPartition::new("srv1", "testdb");
        let offset = SqlServerOffsetContext::new("srv1", "testdb");
        offset.set_position(TxLogPosition::new(lsn(150), lsn(3)), 4, 2);

        let map = offset.offset();
        assert_eq!(map[COMMIT_LSN_KEY], json!("00000000:00000096:0000"));
        assert_eq!(map[OPERATION_KEY], json!(4));
        assert!(!map.contains_key(SNAPSHOT_KEY));

        let restored = SqlServerOffsetContext::from_offset(&partition, &map).unwrap();
        assert_eq!(restored.position(), offset.position());
        assert_eq!(restored.operation(), 4);
        assert_eq!(restored.event_serial_no(), 2);
    }

    #[test]
    fn test_snapshot_offset() {
        let offset = SqlServerOffsetContext::new("srv1", "testdb");
        offset.set_position(TxLogPosition::at_commit(lsn(10)), 0, 0);
        offset.start_snapshot();
        assert!(offset.is_snapshot_running());
        assert_eq!(offset.offset()[SNAPSHOT_KEY], json!(true));

        offset.mark_snapshot_record(SnapshotRecord::Last);
        assert_eq!(offset.source_info()["snapshot"], "last");

        offset.pre_snapshot_completion();
        assert!(!offset.is_snapshot_running());
        let map = offset.offset();
        assert_eq!(map[SNAPSHOT_COMPLETED_KEY], json!(true));
        assert_eq!(offset.source_info()["snapshot"], "false");
    }

    #[test]
    fn test_detached_change_offset() {
        let offset = SqlServerOffsetContext::new("srv1", "testdb");
        let orders = TableId::new("testdb", "dbo", "orders");
        let row = offset.at_change(TxLogPosition::new(lsn(5), lsn(1)), 2, 1, &orders, None);

        assert_eq!(offset.position(), TxLogPosition::NULL);
        assert_eq!(row.source_info()["table"], "orders");

        offset.advance_to(&row);
        assert_eq!(offset.position(), row.position());
    }

    #[test]
    fn test_invalid_offset_rejected() {
        let partition = SqlServerPartition::new("srv1", "testdb");
        let map = OffsetMap::from([(COMMIT_LSN_KEY.to_string(), json!(12))]);
        assert!(SqlServerOffsetContext::from_offset(&partition, &map).is_err());
    }
}
