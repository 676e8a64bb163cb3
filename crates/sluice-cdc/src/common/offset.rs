//! Partitions and offset contexts
//!
//! A [`Partition`] names one logically independent stream of changes and is
//! the key under which progress is stored. An [`OffsetContext`] is the
//! durable progress marker for that partition; every output record carries a
//! copy of its offset map taken when the record was built.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Partition key fields.
pub type SourcePartition = BTreeMap<String, String>;

/// Offset map persisted by the sink after acknowledgement.
pub type OffsetMap = BTreeMap<String, Value>;

/// One logically independent stream of changes (for example one database).
pub trait Partition: Send + Sync + fmt::Debug {
    /// Partition key fields used as the offset-storage key.
    fn source_partition(&self) -> SourcePartition;

    /// Correlation identifier for logs and per-partition bookkeeping.
    fn id(&self) -> String {
        self.source_partition()
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Snapshot marker written into the `source.snapshot` envelope field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotRecord {
    /// First record of the snapshot
    First,
    /// First record of one data collection
    FirstInDataCollection,
    /// Record in the middle of the snapshot
    True,
    /// Last record of one data collection
    LastInDataCollection,
    /// Last record of the whole snapshot
    Last,
    /// Not a snapshot record
    False,
    /// Record produced by an incremental snapshot chunk
    Incremental,
}

impl SnapshotRecord {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotRecord::First => "first",
            SnapshotRecord::FirstInDataCollection => "first_in_data_collection",
            SnapshotRecord::True => "true",
            SnapshotRecord::LastInDataCollection => "last_in_data_collection",
            SnapshotRecord::Last => "last",
            SnapshotRecord::False => "false",
            SnapshotRecord::Incremental => "incremental",
        }
    }

    /// Write this marker into an envelope `source` block.
    ///
    /// Does nothing when the value is not a JSON object.
    pub fn to_source(&self, source: &mut Value) {
        if let Some(obj) = source.as_object_mut() {
            obj.insert("snapshot".to_string(), Value::from(self.as_str()));
        }
    }
}

impl fmt::Display for SnapshotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable progress marker for a partition.
///
/// Implementations use interior mutability: the streaming loop and snapshot
/// workers share one context behind an [`Arc`] and record offsets are
/// captured by value at record-build time.
pub trait OffsetContext: Send + Sync + fmt::Debug {
    /// Current offset map.
    fn offset(&self) -> OffsetMap;

    /// Current `source` block for envelopes.
    fn source_info(&self) -> Value;

    /// Whether a snapshot is in progress.
    fn is_snapshot_running(&self) -> bool;

    /// Set the snapshot marker for the next records.
    fn mark_snapshot_record(&self, record: SnapshotRecord);

    /// Called right before the final snapshot record is flushed.
    fn pre_snapshot_completion(&self);

    /// Render the offset map for log lines and error messages.
    fn describe(&self) -> String {
        render_offset(&self.offset())
    }
}

/// Shared offset context handle.
pub type SharedOffsetContext = Arc<dyn OffsetContext>;

/// Render an offset map as `{k=v, ...}`.
pub fn render_offset(offset: &OffsetMap) -> String {
    let body = offset
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{}}}", body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct DbPartition;

    impl Partition for DbPartition {
        fn source_partition(&self) -> SourcePartition {
            SourcePartition::from([
                ("database".to_string(), "testdb".to_string()),
                ("server".to_string(), "srv1".to_string()),
            ])
        }
    }

    #[test]
    fn test_partition_id_joins_values() {
        assert_eq!(DbPartition.id(), "testdb/srv1");
    }

    #[test]
    fn test_snapshot_marker_into_source() {
        let mut source = json!({"db": "testdb", "snapshot": "true"});
        SnapshotRecord::Last.to_source(&mut source);
        assert_eq!(source["snapshot"], "last");

        let mut not_object = json!(null);
        SnapshotRecord::Last.to_source(&mut not_object);
        assert!(not_object.is_null());
    }

    #[test]
    fn test_render_offset() {
        let offset = OffsetMap::from([
            ("commit_lsn".to_string(), json!("0000002a:00000000:0001")),
            ("event_serial_no".to_string(), json!(2)),
        ]);
        assert_eq!(
            render_offset(&offset),
            "{commit_lsn=0000002a:00000000:0001, event_serial_no=2}"
        );
    }
}
