//! # Transaction Monitor
//!
//! Tracks one open transaction per partition and assigns every data event a
//! per-transaction sequence number.
//!
//! When transaction metadata is enabled it also:
//! - publishes **BEGIN** and **END** boundary records to `<prefix>.transaction`
//! - adds a `transaction` block to every data event value:
//!
//! ```json
//! {"id": "tx-42", "total_order": 3, "data_collection_order": 2}
//! ```

use crate::common::event::{Headers, OutputRecord, RecordSchema, SchemaRef};
use crate::common::offset::{OffsetContext, OffsetMap, Partition};
use crate::common::queue::ChangeEventQueue;
use crate::common::schema::TableId;
use crate::common::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Transaction status in boundary records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    /// Transaction has started
    Begin,
    /// Transaction has committed
    End,
}

/// Event count per data collection in a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataCollectionEventCount {
    pub data_collection: String,
    pub event_count: u64,
}

/// Transaction boundary payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub status: TransactionStatus,
    pub id: String,
    pub ts_ms: i64,
    /// Only for END records
    pub event_count: Option<u64>,
    /// Only for END records
    pub data_collections: Option<Vec<DataCollectionEventCount>>,
}

/// Open transaction of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    /// Offset at which the transaction started
    pub start_offset: OffsetMap,
    pub started_at: DateTime<Utc>,
    /// Data events seen so far
    pub event_count: u64,
    per_collection: BTreeMap<String, u64>,
}

impl Transaction {
    fn new(id: String, start_offset: OffsetMap, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            start_offset,
            started_at,
            event_count: 0,
            per_collection: BTreeMap::new(),
        }
    }

    fn record_event(&mut self, id: &TableId) -> TransactionStamp {
        self.event_count += 1;
        let per_collection = self.per_collection.entry(id.to_string()).or_insert(0);
        *per_collection += 1;
        TransactionStamp {
            id: self.id.clone(),
            total_order: self.event_count,
            data_collection_order: *per_collection,
        }
    }

    /// Event count of one data collection.
    pub fn collection_event_count(&self, id: &TableId) -> u64 {
        self.per_collection.get(&id.to_string()).copied().unwrap_or(0)
    }
}

/// Position of one data event inside its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionStamp {
    pub id: String,
    /// 1-based position among all events of the transaction
    pub total_order: u64,
    /// 1-based position among events of the same collection
    pub data_collection_order: u64,
}

impl TransactionStamp {
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "total_order": self.total_order,
            "data_collection_order": self.data_collection_order,
        })
    }
}

/// Per-partition transaction bookkeeping.
#[derive(Debug)]
pub struct TransactionMonitor {
    enabled: bool,
    topic: String,
    queue: Arc<ChangeEventQueue>,
    key_schema: SchemaRef,
    value_schema: SchemaRef,
    open: Mutex<HashMap<String, Transaction>>,
}

impl TransactionMonitor {
    pub fn new(enabled: bool, topic: impl Into<String>, queue: Arc<ChangeEventQueue>) -> Self {
        Self {
            enabled,
            topic: topic.into(),
            queue,
            key_schema: Arc::new(RecordSchema::new(
                "io.debezium.connector.common.TransactionMetadataKey",
                vec!["id".to_string()],
            )),
            value_schema: Arc::new(RecordSchema::new(
                "io.debezium.connector.common.TransactionMetadataValue",
                vec![
                    "status".to_string(),
                    "id".to_string(),
                    "ts_ms".to_string(),
                    "event_count".to_string(),
                    "data_collections".to_string(),
                ],
            )),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Snapshot of the open transaction of a partition.
    pub fn open_transaction(&self, partition: &dyn Partition) -> Option<Transaction> {
        self.open.lock().get(&partition.id()).cloned()
    }

    /// Open a transaction.
    ///
    /// A still-open transaction with a different id is committed first.
    /// Restarting the currently open id is a no-op.
    pub async fn transaction_started(
        &self,
        partition: &dyn Partition,
        transaction_id: &str,
        offset: &dyn OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let key = partition.id();
        let previous = {
            let mut open = self.open.lock();
            match open.get(&key) {
                Some(current) if current.id == transaction_id => {
                    trace!(transaction = %transaction_id, "Transaction already open");
                    return Ok(());
                }
                _ => {}
            }
            let previous = open.remove(&key);
            open.insert(
                key.clone(),
                Transaction::new(transaction_id.to_string(), offset.offset(), timestamp),
            );
            previous
        };

        if let Some(previous) = previous {
            warn!(
                partition = %key,
                previous = %previous.id,
                next = %transaction_id,
                "Transaction started before previous one committed; closing it"
            );
            self.emit_end(partition, &previous, offset, timestamp).await?;
        }

        debug!(partition = %key, transaction = %transaction_id, "Transaction started");
        if self.enabled {
            let event = TransactionEvent {
                status: TransactionStatus::Begin,
                id: transaction_id.to_string(),
                ts_ms: timestamp.timestamp_millis(),
                event_count: None,
                data_collections: None,
            };
            self.emit(partition, offset, event).await?;
        }
        Ok(())
    }

    /// Count a data event and enrich its value when metadata is enabled.
    ///
    /// Returns `None` when the partition has no open transaction.
    pub fn data_event(
        &self,
        partition: &dyn Partition,
        id: &TableId,
        value: &mut Value,
    ) -> Option<TransactionStamp> {
        let stamp = self
            .open
            .lock()
            .get_mut(&partition.id())
            .map(|tx| tx.record_event(id))?;

        if self.enabled {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("transaction".to_string(), stamp.to_value());
            }
        }
        Some(stamp)
    }

    /// Close the open transaction of a partition exactly once.
    pub async fn transaction_committed(
        &self,
        partition: &dyn Partition,
        offset: &dyn OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let closed = self.open.lock().remove(&partition.id());
        match closed {
            Some(tx) => {
                debug!(
                    partition = %partition.id(),
                    transaction = %tx.id,
                    events = tx.event_count,
                    "Transaction committed"
                );
                self.emit_end(partition, &tx, offset, timestamp).await
            }
            None => {
                trace!(partition = %partition.id(), "Commit without open transaction");
                Ok(())
            }
        }
    }

    async fn emit_end(
        &self,
        partition: &dyn Partition,
        tx: &Transaction,
        offset: &dyn OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let event = TransactionEvent {
            status: TransactionStatus::End,
            id: tx.id.clone(),
            ts_ms: timestamp.timestamp_millis(),
            event_count: Some(tx.event_count),
            data_collections: Some(
                tx.per_collection
                    .iter()
                    .map(|(name, count)| DataCollectionEventCount {
                        data_collection: name.clone(),
                        event_count: *count,
                    })
                    .collect(),
            ),
        };
        self.emit(partition, offset, event).await
    }

    async fn emit(
        &self,
        partition: &dyn Partition,
        offset: &dyn OffsetContext,
        event: TransactionEvent,
    ) -> Result<()> {
        let record = OutputRecord {
            source_partition: partition.source_partition(),
            source_offset: offset.offset(),
            topic: self.topic.clone(),
            kafka_partition: None,
            key_schema: Some(self.key_schema.clone()),
            key: Some(json!({ "id": event.id })),
            value_schema: Some(self.value_schema.clone()),
            timestamp: Some(event.ts_ms),
            value: Some(serde_json::to_value(&event)?),
            headers: Headers::new(),
        };
        self.queue.enqueue(record).await
    }
}
