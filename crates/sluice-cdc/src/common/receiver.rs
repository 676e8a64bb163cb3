//! # Change Record Receivers
//!
//! The last stage of the dispatch pipeline: turn an emitted change tuple into
//! an [`OutputRecord`] and hand it to the outbound queue.
//!
//! | Receiver | Used for | Behavior |
//! |----------|----------|----------|
//! | [`StreamingChangeRecordReceiver`] | streaming | enqueue now, tombstone after deletes |
//! | [`BufferingSnapshotChangeRecordReceiver`] | initial snapshot | hold one record back so the last one can be marked |
//! | [`IncrementalSnapshotChangeRecordReceiver`] | incremental snapshot chunks | enqueue now, notify the listener |
//!
//! ## Buffering across workers
//!
//! With several snapshot workers sharing one queue, the buffering receiver
//! performs "swap in the new record, enqueue the previous one" under the
//! queue's snapshot lock. Streaming producers never take that lock.

use crate::common::emitter::EmittedChange;
use crate::common::event::{Headers, Operation, OutputRecord};
use crate::common::listener::DataChangeEventListener;
use crate::common::offset::{OffsetContext, Partition, SharedOffsetContext, SnapshotRecord};
use crate::common::queue::ChangeEventQueue;
use crate::common::schema::DataCollectionSchema;
use crate::common::topic::TopicNamingStrategy;
use crate::common::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

/// Hook applied to every data record's key and value before it is built.
pub trait PostProcessor: Send + Sync {
    fn apply(&self, key: Option<&Value>, value: &mut Value);
}

impl<F> PostProcessor for F
where
    F: Fn(Option<&Value>, &mut Value) + Send + Sync,
{
    fn apply(&self, key: Option<&Value>, value: &mut Value) {
        self(key, value)
    }
}

/// Accepts change tuples from the dispatcher.
#[async_trait]
pub trait ChangeRecordReceiver: Send + Sync {
    async fn change_record(
        &self,
        partition: &dyn Partition,
        schema: &DataCollectionSchema,
        change: EmittedChange,
        offset: SharedOffsetContext,
    ) -> Result<()>;
}

/// Receiver used while a snapshot is produced.
#[async_trait]
pub trait SnapshotReceiver: ChangeRecordReceiver {
    /// Flush whatever is still pending once the snapshot is done.
    async fn complete_snapshot(&self) -> Result<()>;
}

/// Shared state for building data records.
pub struct RecordBuilder {
    queue: Arc<ChangeEventQueue>,
    topics: TopicNamingStrategy,
    post_processors: Vec<Arc<dyn PostProcessor>>,
    /// Task context headers, empty when extended headers are disabled
    extended_headers: Headers,
    emit_tombstones_on_delete: bool,
}

impl std::fmt::Debug for RecordBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBuilder")
            .field("topics", &self.topics)
            .field("post_processors", &self.post_processors.len())
            .field("extended_headers", &self.extended_headers)
            .field("emit_tombstones_on_delete", &self.emit_tombstones_on_delete)
            .finish()
    }
}

impl RecordBuilder {
    pub fn new(queue: Arc<ChangeEventQueue>, topics: TopicNamingStrategy) -> Self {
        Self {
            queue,
            topics,
            post_processors: Vec::new(),
            extended_headers: Headers::new(),
            emit_tombstones_on_delete: true,
        }
    }

    pub fn with_post_processors(mut self, processors: Vec<Arc<dyn PostProcessor>>) -> Self {
        self.post_processors = processors;
        self
    }

    pub fn with_extended_headers(mut self, headers: Headers) -> Self {
        self.extended_headers = headers;
        self
    }

    pub fn with_tombstones_on_delete(mut self, enabled: bool) -> Self {
        self.emit_tombstones_on_delete = enabled;
        self
    }

    pub fn queue(&self) -> &Arc<ChangeEventQueue> {
        &self.queue
    }

    pub fn topics(&self) -> &TopicNamingStrategy {
        &self.topics
    }

    /// Build the output record for one change tuple.
    ///
    /// The offset map is captured now, so later offset updates do not leak
    /// into records already built.
    pub fn build(
        &self,
        partition: &dyn Partition,
        schema: &DataCollectionSchema,
        change: EmittedChange,
        offset: &dyn OffsetContext,
    ) -> OutputRecord {
        let EmittedChange {
            operation,
            key,
            mut value,
            mut headers,
        } = change;

        let key_schema = if operation == Operation::Truncate && key.is_none() {
            None
        } else {
            schema.key_schema.clone()
        };

        for processor in &self.post_processors {
            processor.apply(key.as_ref(), &mut value);
        }
        headers.extend(self.extended_headers.iter().cloned());

        let timestamp = value.get("ts_ms").and_then(Value::as_i64);
        OutputRecord {
            source_partition: partition.source_partition(),
            source_offset: offset.offset(),
            topic: self.topics.data_change_topic(&schema.id),
            kafka_partition: None,
            key_schema,
            key,
            value_schema: Some(schema.envelope_schema.clone()),
            value: Some(value),
            timestamp,
            headers,
        }
    }
}

// ============================================================================
// Streaming
// ============================================================================

/// Enqueues immediately; follows deletes with a tombstone when enabled.
#[derive(Debug)]
pub struct StreamingChangeRecordReceiver {
    builder: Arc<RecordBuilder>,
}

impl StreamingChangeRecordReceiver {
    pub fn new(builder: Arc<RecordBuilder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl ChangeRecordReceiver for StreamingChangeRecordReceiver {
    async fn change_record(
        &self,
        partition: &dyn Partition,
        schema: &DataCollectionSchema,
        change: EmittedChange,
        offset: SharedOffsetContext,
    ) -> Result<()> {
        let operation = change.operation;
        let record = self.builder.build(partition, schema, change, offset.as_ref());
        let tombstone = (operation == Operation::Delete && self.builder.emit_tombstones_on_delete)
            .then(|| record.tombstone());

        self.builder.queue.enqueue(record).await?;
        if let Some(tombstone) = tombstone {
            trace!(table = %schema.id, "Emitting tombstone");
            self.builder.queue.enqueue(tombstone).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Buffering snapshot
// ============================================================================

/// Pending record held back by the buffering receiver.
#[derive(Debug)]
struct BufferedEvent {
    record: OutputRecord,
    offset: SharedOffsetContext,
}

/// Holds back exactly one record so the final snapshot record can be marked.
#[derive(Debug)]
pub struct BufferingSnapshotChangeRecordReceiver {
    builder: Arc<RecordBuilder>,
    /// Take the queue's snapshot lock around swap-and-enqueue
    threaded: bool,
    buffered: Mutex<Option<BufferedEvent>>,
}

impl BufferingSnapshotChangeRecordReceiver {
    pub fn new(builder: Arc<RecordBuilder>, threaded: bool) -> Self {
        Self {
            builder,
            threaded,
            buffered: Mutex::new(None),
        }
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    /// Whether a record is waiting to be flushed.
    pub fn has_pending(&self) -> bool {
        self.buffered.lock().is_some()
    }

    async fn swap_and_enqueue(&self, next: BufferedEvent) -> Result<()> {
        let previous = self.buffered.lock().replace(next);
        if let Some(previous) = previous {
            self.builder.queue.enqueue(previous.record).await?;
        }
        Ok(())
    }

    async fn flush_last(&self) -> Result<()> {
        let last = self.buffered.lock().take();
        let Some(BufferedEvent { mut record, offset }) = last else {
            debug!("Snapshot completed without buffered records");
            return Ok(());
        };

        offset.pre_snapshot_completion();
        if let Some(source) = record.value.as_mut().and_then(|v| v.get_mut("source")) {
            SnapshotRecord::Last.to_source(source);
        }
        record.source_offset = offset.offset();

        debug!(topic = %record.topic, "Flushing last snapshot record");
        self.builder.queue.enqueue(record).await
    }
}

#[async_trait]
impl ChangeRecordReceiver for BufferingSnapshotChangeRecordReceiver {
    async fn change_record(
        &self,
        partition: &dyn Partition,
        schema: &DataCollectionSchema,
        change: EmittedChange,
        offset: SharedOffsetContext,
    ) -> Result<()> {
        let record = self.builder.build(partition, schema, change, offset.as_ref());
        let next = BufferedEvent { record, offset };

        if self.threaded {
            let _guard = self.builder.queue.lock_snapshot().await;
            self.swap_and_enqueue(next).await
        } else {
            self.swap_and_enqueue(next).await
        }
    }
}

#[async_trait]
impl SnapshotReceiver for BufferingSnapshotChangeRecordReceiver {
    async fn complete_snapshot(&self) -> Result<()> {
        if self.threaded {
            let _guard = self.builder.queue.lock_snapshot().await;
            self.flush_last().await
        } else {
            self.flush_last().await
        }
    }
}

// ============================================================================
// Incremental snapshot
// ============================================================================

/// Enqueues chunk rows immediately and reports them to the listener.
pub struct IncrementalSnapshotChangeRecordReceiver {
    builder: Arc<RecordBuilder>,
    listener: Arc<dyn DataChangeEventListener>,
}

impl std::fmt::Debug for IncrementalSnapshotChangeRecordReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalSnapshotChangeRecordReceiver")
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}

impl IncrementalSnapshotChangeRecordReceiver {
    pub fn new(builder: Arc<RecordBuilder>, listener: Arc<dyn DataChangeEventListener>) -> Self {
        Self { builder, listener }
    }
}

#[async_trait]
impl ChangeRecordReceiver for IncrementalSnapshotChangeRecordReceiver {
    async fn change_record(
        &self,
        partition: &dyn Partition,
        schema: &DataCollectionSchema,
        change: EmittedChange,
        offset: SharedOffsetContext,
    ) -> Result<()> {
        let operation = change.operation;
        let record = self.builder.build(partition, schema, change, offset.as_ref());
        if let Some(value) = &record.value {
            self.listener.on_snapshot_row(
                partition,
                &schema.id,
                record.key_schema.as_ref(),
                value,
                operation,
            );
        }
        self.builder.queue.enqueue(record).await
    }
}

#[async_trait]
impl SnapshotReceiver for IncrementalSnapshotChangeRecordReceiver {
    async fn complete_snapshot(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::listener::CountingEventListener;
    use crate::common::offset::{OffsetMap, SourcePartition};
    use crate::common::schema::{ColumnDefinition, TableId};
    use parking_lot::RwLock;
    use serde_json::json;

    #[derive(Debug)]
    struct P;

    impl Partition for P {
        fn source_partition(&self) -> SourcePartition {
            SourcePartition::from([("server".to_string(), "srv1".to_string())])
        }
    }

    #[derive(Debug, Default)]
    struct SnapshotOffset {
        completed: RwLock<bool>,
    }

    impl OffsetContext for SnapshotOffset {
        fn offset(&self) -> OffsetMap {
            OffsetMap::from([
                ("snapshot".to_string(), json!(true)),
                ("snapshot_completed".to_string(), json!(*self.completed.read())),
            ])
        }
        fn source_info(&self) -> Value {
            json!({"snapshot": "true"})
        }
        fn is_snapshot_running(&self) -> bool {
            !*self.completed.read()
        }
        fn mark_snapshot_record(&self, _record: SnapshotRecord) {}
        fn pre_snapshot_completion(&self) {
            *self.completed.write() = true;
        }
    }

    fn schema() -> DataCollectionSchema {
        DataCollectionSchema::new(
            TableId::new("testdb", "dbo", "orders"),
            vec![ColumnDefinition::new("id", "int", 1)],
            vec!["id".into()],
        )
    }

    fn change(op: Operation, id: i64) -> EmittedChange {
        EmittedChange::new(
            op,
            Some(json!({"id": id})),
            json!({"after": {"id": id}, "source": {"snapshot": "true"}, "op": op.code(), "ts_ms": 1}),
        )
    }

    fn builder(capacity: usize) -> (Arc<RecordBuilder>, crate::common::queue::ChangeEventQueueConsumer) {
        let (queue, consumer) = ChangeEventQueue::new(capacity);
        let builder = RecordBuilder::new(queue, TopicNamingStrategy::new("srv1", "hb"));
        (Arc::new(builder), consumer)
    }

    #[tokio::test]
    async fn test_streaming_delete_followed_by_tombstone() {
        let (builder, mut consumer) = builder(8);
        let receiver = StreamingChangeRecordReceiver::new(builder);
        let offset: SharedOffsetContext = Arc::new(SnapshotOffset::default());

        receiver
            .change_record(&P, &schema(), change(Operation::Delete, 1), offset.clone())
            .await
            .unwrap();
        receiver
            .change_record(&P, &schema(), change(Operation::Update, 2), offset)
            .await
            .unwrap();

        let records = consumer.drain();
        assert_eq!(records.len(), 3);
        assert!(records[1].is_tombstone());
        assert_eq!(records[1].key, records[0].key);
        assert_eq!(records[2].operation(), Some(Operation::Update));
    }

    #[tokio::test]
    async fn test_tombstones_can_be_disabled() {
        let (queue, mut consumer) = ChangeEventQueue::new(8);
        let builder = RecordBuilder::new(queue, TopicNamingStrategy::new("srv1", "hb"))
            .with_tombstones_on_delete(false);
        let receiver = StreamingChangeRecordReceiver::new(Arc::new(builder));

        receiver
            .change_record(
                &P,
                &schema(),
                change(Operation::Delete, 1),
                Arc::new(SnapshotOffset::default()),
            )
            .await
            .unwrap();
        assert_eq!(consumer.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_truncate_without_key_has_no_key_schema() {
        let (builder, _consumer) = builder(8);
        let truncate = EmittedChange::new(Operation::Truncate, None, json!({"op": "t"}));
        let record = builder.build(&P, &schema(), truncate, &SnapshotOffset::default());
        assert!(record.key_schema.is_none());

        let record = builder.build(&P, &schema(), change(Operation::Create, 1), &SnapshotOffset::default());
        assert!(record.key_schema.is_some());
    }

    #[tokio::test]
    async fn test_post_processors_and_extended_headers() {
        let (queue, _consumer) = ChangeEventQueue::new(8);
        let mut headers = Headers::new();
        headers.add("context.taskId", "0");
        let mask: Arc<dyn PostProcessor> = Arc::new(|_key: Option<&Value>, value: &mut Value| {
            value["after"]["id"] = json!("***");
        });
        let builder = RecordBuilder::new(queue, TopicNamingStrategy::new("srv1", "hb"))
            .with_post_processors(vec![mask])
            .with_extended_headers(headers);

        let record = builder.build(&P, &schema(), change(Operation::Create, 1), &SnapshotOffset::default());
        assert_eq!(record.value.as_ref().unwrap()["after"]["id"], "***");
        assert_eq!(record.headers.last_with_name("context.taskId"), Some(&json!("0")));
        assert_eq!(record.topic, "srv1.testdb.dbo.orders");
        assert_eq!(record.timestamp, Some(1));
    }

    #[tokio::test]
    async fn test_buffering_marks_last_record() {
        let (builder, mut consumer) = builder(8);
        let receiver = BufferingSnapshotChangeRecordReceiver::new(builder, false);
        let offset: SharedOffsetContext = Arc::new(SnapshotOffset::default());

        for id in 1..=3 {
            receiver
                .change_record(&P, &schema(), change(Operation::Read, id), offset.clone())
                .await
                .unwrap();
        }
        // One record is always held back
        assert_eq!(consumer.drain().len(), 2);
        assert!(receiver.has_pending());

        receiver.complete_snapshot().await.unwrap();
        let last = consumer.drain();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].key, Some(json!({"id": 3})));
        assert_eq!(last[0].snapshot_marker(), Some("last"));
        assert_eq!(last[0].source_offset["snapshot_completed"], json!(true));
        assert!(!receiver.has_pending());
    }

    #[tokio::test]
    async fn test_complete_empty_snapshot_is_noop() {
        let (builder, mut consumer) = builder(8);
        let receiver = BufferingSnapshotChangeRecordReceiver::new(builder, true);
        receiver.complete_snapshot().await.unwrap();
        assert!(consumer.drain().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_receiver_notifies_listener() {
        let (builder, mut consumer) = builder(8);
        let listener = Arc::new(CountingEventListener::new());
        let receiver = IncrementalSnapshotChangeRecordReceiver::new(builder, listener.clone());

        receiver
            .change_record(
                &P,
                &schema(),
                change(Operation::Read, 1),
                Arc::new(SnapshotOffset::default()),
            )
            .await
            .unwrap();
        receiver.complete_snapshot().await.unwrap();

        assert_eq!(listener.snapshot_rows(), 1);
        assert_eq!(consumer.drain().len(), 1);
    }
}
