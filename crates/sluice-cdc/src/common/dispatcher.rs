//! # Event Dispatcher
//!
//! Central routing point between change sources and the outbound queue.
//!
//! ## Data change flow
//!
//! ```text
//! emitter ──► filter ──► schema ──► emit tuples ──┬─► signal? ──► signal channel (sync)
//!               │                                  │
//!               ▼                                  └─► skip set ──► transaction monitor
//!        filtered notification                                    ──► listener
//!                                                                 ──► incremental snapshot
//!                                                                 ──► streaming receiver ──► queue
//! ```
//!
//! After a successful dispatch a heartbeat is emitted if one is due.
//!
//! ## Failure handling
//!
//! | Mode | Behavior |
//! |------|----------|
//! | `Fail` | wrap in [`CdcError::EventProcessing`] with the offset and abort |
//! | `Warn` | `warn!` and continue, offset not advanced |
//! | `Skip` | `debug!` and continue |
//!
//! Interruptions always propagate.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (queue, consumer) = ChangeEventQueue::new(config.max_queue_size);
//! let dispatcher = EventDispatcher::builder(config, schema, queue)
//!     .task_context(task_context)
//!     .signal_processor(signals)
//!     .build()?;
//!
//! dispatcher.dispatch_data_change_event(&partition, &table_id, &emitter).await?;
//! ```

use crate::common::config::{ConnectorConfig, EventProcessingFailureHandlingMode, WatermarkStrategy};
use crate::common::emitter::ChangeRecordEmitter;
use crate::common::event::{Operation, OutputRecord};
use crate::common::heartbeat::Heartbeat;
use crate::common::incremental_snapshot::{
    IncrementalSnapshotChangeEventSource, NoIncrementalSnapshot,
};
use crate::common::listener::{DataChangeEventListener, NoopEventListener};
use crate::common::offset::{OffsetContext, Partition, SharedOffsetContext};
use crate::common::queue::ChangeEventQueue;
use crate::common::receiver::{
    BufferingSnapshotChangeRecordReceiver, ChangeRecordReceiver,
    IncrementalSnapshotChangeRecordReceiver, PostProcessor, RecordBuilder, SnapshotReceiver,
    StreamingChangeRecordReceiver,
};
use crate::common::schema::{DataCollectionSchema, DatabaseSchema, TableId};
use crate::common::schema_change::{SchemaChangeEvent, SchemaChangeEventEmitter};
use crate::common::signal::SignalProcessor;
use crate::common::task::CdcSourceTaskContext;
use crate::common::topic::TopicNamingStrategy;
use crate::common::transaction::TransactionMonitor;
use crate::common::{CdcError, DataCollectionFilter, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, debug_span, trace, warn, Instrument};

// ============================================================================
// Inconsistent schema handling
// ============================================================================

/// Decides what happens when a watched collection has no schema.
pub trait InconsistentSchemaHandler: Send + Sync {
    /// Return a schema to continue with, `None` to drop the event, or an error.
    fn handle(
        &self,
        partition: &dyn Partition,
        id: &TableId,
        emitter: &dyn ChangeRecordEmitter,
    ) -> Result<Option<Arc<DataCollectionSchema>>>;
}

/// Fails with [`CdcError::MissingSchema`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FailOnMissingSchema;

impl InconsistentSchemaHandler for FailOnMissingSchema {
    fn handle(
        &self,
        _partition: &dyn Partition,
        id: &TableId,
        _emitter: &dyn ChangeRecordEmitter,
    ) -> Result<Option<Arc<DataCollectionSchema>>> {
        Err(CdcError::missing_schema(id))
    }
}

/// Drops events of collections without a schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreMissingSchema;

impl InconsistentSchemaHandler for IgnoreMissingSchema {
    fn handle(
        &self,
        partition: &dyn Partition,
        id: &TableId,
        emitter: &dyn ChangeRecordEmitter,
    ) -> Result<Option<Arc<DataCollectionSchema>>> {
        debug!(
            partition = %partition.id(),
            table = %id,
            operation = %emitter.operation(),
            "Dropping event for table without schema"
        );
        Ok(None)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Dispatcher statistics.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    dispatched: AtomicU64,
    filtered: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    signals: AtomicU64,
    schema_changes: AtomicU64,
}

impl DispatcherStats {
    /// Data tuples handed to the streaming receiver
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Events dropped by the table filter or their emitter
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Tuples dropped by the skip set
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Failures tolerated under WARN or SKIP
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn signals(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }

    pub fn schema_changes(&self) -> u64 {
        self.schema_changes.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes change events through filtering, bookkeeping and receivers.
pub struct EventDispatcher {
    config: ConnectorConfig,
    schema: Arc<dyn DatabaseSchema>,
    queue: Arc<ChangeEventQueue>,
    filter: DataCollectionFilter,
    topics: TopicNamingStrategy,
    builder: Arc<RecordBuilder>,
    streaming_receiver: StreamingChangeRecordReceiver,
    skipped_operations: HashSet<Operation>,
    inconsistent_schema_handler: Arc<dyn InconsistentSchemaHandler>,
    transaction_monitor: TransactionMonitor,
    heartbeat: Heartbeat,
    signal_processor: Option<Arc<SignalProcessor>>,
    listener: Arc<dyn DataChangeEventListener>,
    incremental: Arc<dyn IncrementalSnapshotChangeEventSource>,
    stats: Arc<DispatcherStats>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("topic_prefix", &self.config.topic_prefix)
            .field("skipped_operations", &self.skipped_operations)
            .field(
                "failure_mode",
                &self.config.event_processing_failure_handling_mode,
            )
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    pub fn builder(
        config: ConnectorConfig,
        schema: Arc<dyn DatabaseSchema>,
        queue: Arc<ChangeEventQueue>,
    ) -> EventDispatcherBuilder {
        EventDispatcherBuilder {
            config,
            schema,
            queue,
            task_context: None,
            inconsistent_schema_handler: Arc::new(FailOnMissingSchema),
            signal_processor: None,
            post_processors: Vec::new(),
            listener: Arc::new(NoopEventListener),
            incremental: Arc::new(NoIncrementalSnapshot),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<DispatcherStats> {
        &self.stats
    }

    pub fn transaction_monitor(&self) -> &TransactionMonitor {
        &self.transaction_monitor
    }

    pub fn set_event_listener(&mut self, listener: Arc<dyn DataChangeEventListener>) {
        self.listener = listener;
    }

    pub fn set_incremental_snapshot_source(
        &mut self,
        source: Arc<dyn IncrementalSnapshotChangeEventSource>,
    ) {
        self.incremental = source;
    }

    // ------------------------------------------------------------------------
    // Data changes
    // ------------------------------------------------------------------------

    /// Dispatch one streamed change.
    ///
    /// Returns whether the change was handled (not filtered and had a schema).
    pub async fn dispatch_data_change_event(
        &self,
        partition: &dyn Partition,
        id: &TableId,
        emitter: &dyn ChangeRecordEmitter,
    ) -> Result<bool> {
        let offset = emitter.offset();
        let span = debug_span!("dispatch", partition = %partition.id(), table = %id);

        async {
            match self.dispatch_change(partition, id, emitter, &offset).await {
                Ok(handled) => Ok(handled),
                Err(e) => {
                    self.handle_event_processing_failure(e, offset.as_ref())?;
                    Ok(false)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch_change(
        &self,
        partition: &dyn Partition,
        id: &TableId,
        emitter: &dyn ChangeRecordEmitter,
        offset: &SharedOffsetContext,
    ) -> Result<bool> {
        if emitter.ignore_record() || !self.filter.is_included(id) {
            trace!("Filtered data change event for {}", id);
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            self.listener.on_filtered_event(
                partition,
                &format!("source = {}", id),
                Some(emitter.operation()),
            );
            self.dispatch_filtered_event(partition, offset.as_ref()).await?;
            self.dispatch_heartbeat_event(partition, offset.as_ref()).await?;
            return Ok(false);
        }

        let schema = match self.schema.schema_for(id) {
            Some(schema) => schema,
            None => match self.inconsistent_schema_handler.handle(partition, id, emitter) {
                Ok(Some(schema)) => schema,
                Ok(None) => return Ok(false),
                Err(e) => {
                    self.listener.on_erroneous_event(
                        partition,
                        &format!("source = {}", id),
                        Some(emitter.operation()),
                    );
                    return Err(e);
                }
            },
        };

        for mut change in emitter.emit_change_records(&schema)? {
            if self.is_signal_record(id, change.operation) {
                self.process_signal(&change.value).await?;
            }

            if self.skipped_operations.contains(&change.operation) {
                trace!(operation = %change.operation, "Skipping operation");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.transaction_monitor
                .data_event(partition, id, &mut change.value);
            self.listener.on_event(
                partition,
                id,
                offset.as_ref(),
                change.key.as_ref(),
                &change.value,
                change.operation,
            );
            self.incremental
                .process_message(partition, id, change.key.as_ref(), offset.as_ref())
                .await?;
            self.streaming_receiver
                .change_record(partition, &schema, change, offset.clone())
                .await?;
            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        }

        self.dispatch_heartbeat_event(partition, offset.as_ref()).await?;
        Ok(true)
    }

    fn is_signal_record(&self, id: &TableId, operation: Operation) -> bool {
        if !self.config.is_signal_data_collection(id) {
            return false;
        }
        match operation {
            Operation::Create => true,
            Operation::Delete => {
                self.config.incremental_snapshot_watermarking_strategy
                    == WatermarkStrategy::InsertDelete
            }
            _ => false,
        }
    }

    /// Hand a signal row to the signal channel and run it to completion.
    async fn process_signal(&self, value: &serde_json::Value) -> Result<()> {
        let Some(processor) = &self.signal_processor else {
            trace!("Signal record without signal processor");
            return Ok(());
        };
        processor.source_channel().process(value)?;
        for result in processor.process_source_signal().await {
            if let crate::common::signal::SignalResult::Failed(msg) = result {
                return Err(CdcError::signal(msg));
            }
        }
        self.stats.signals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn handle_event_processing_failure(
        &self,
        error: CdcError,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        if error.is_interruption() {
            return Err(error);
        }
        match self.config.event_processing_failure_handling_mode {
            EventProcessingFailureHandlingMode::Fail => {
                Err(CdcError::event_processing(offset.describe(), error))
            }
            EventProcessingFailureHandlingMode::Warn => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    offset = %offset.describe(),
                    error = %error,
                    "Error while processing event, skipping"
                );
                Ok(())
            }
            EventProcessingFailureHandlingMode::Skip => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    offset = %offset.describe(),
                    error = %error,
                    "Error while processing event, skipping"
                );
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Dispatch one snapshot row to a snapshot receiver.
    ///
    /// A missing schema always fails here.
    pub async fn dispatch_snapshot_event(
        &self,
        partition: &dyn Partition,
        id: &TableId,
        emitter: &dyn ChangeRecordEmitter,
        receiver: &dyn SnapshotReceiver,
    ) -> Result<()> {
        let offset = emitter.offset();
        let Some(schema) = self.schema.schema_for(id) else {
            self.listener.on_erroneous_event(
                partition,
                &format!("source = {}", id),
                Some(emitter.operation()),
            );
            return Err(CdcError::missing_schema(id));
        };

        for change in emitter.emit_change_records(&schema)? {
            self.listener.on_event(
                partition,
                &schema.id,
                offset.as_ref(),
                change.key.as_ref(),
                &change.value,
                change.operation,
            );
            receiver
                .change_record(partition, &schema, change, offset.clone())
                .await?;
        }
        Ok(())
    }

    /// Buffering receiver for an initial snapshot.
    ///
    /// Shares the queue's snapshot lock when several snapshot workers run.
    pub fn snapshot_change_event_receiver(&self) -> BufferingSnapshotChangeRecordReceiver {
        BufferingSnapshotChangeRecordReceiver::new(
            self.builder.clone(),
            self.config.snapshot_max_threads > 1,
        )
    }

    pub fn incremental_snapshot_change_event_receiver(
        &self,
        listener: Arc<dyn DataChangeEventListener>,
    ) -> IncrementalSnapshotChangeRecordReceiver {
        IncrementalSnapshotChangeRecordReceiver::new(self.builder.clone(), listener)
    }

    /// Notify the incremental snapshot of a filtered event.
    pub async fn dispatch_filtered_event(
        &self,
        partition: &dyn Partition,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.incremental.process_filtered_event(partition, offset).await
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    pub async fn dispatch_transaction_started_event(
        &self,
        partition: &dyn Partition,
        transaction_id: &str,
        offset: &dyn OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.transaction_monitor
            .transaction_started(partition, transaction_id, offset, timestamp)
            .await?;
        self.incremental
            .process_transaction_started(partition, offset)
            .await
    }

    pub async fn dispatch_transaction_committed_event(
        &self,
        partition: &dyn Partition,
        offset: &dyn OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.transaction_monitor
            .transaction_committed(partition, offset, timestamp)
            .await?;
        self.incremental
            .process_transaction_committed(partition, offset)
            .await
    }

    // ------------------------------------------------------------------------
    // Schema changes
    // ------------------------------------------------------------------------

    /// Dispatch schema changes for one collection (`None` for database-level DDL).
    pub async fn dispatch_schema_change_event(
        &self,
        partition: &dyn Partition,
        id: Option<&TableId>,
        emitter: &dyn SchemaChangeEventEmitter,
    ) -> Result<()> {
        if let Some(id) = id {
            if !self.filter.is_included(id) && !self.keeps_non_captured_history() {
                trace!("Filtering schema change event for {}", id);
                return Ok(());
            }
        }
        for event in emitter.emit_schema_change_events()? {
            self.schema_change_event(event).await?;
        }
        self.incremental.process_schema_change(partition, id).await
    }

    /// Dispatch schema changes touching several collections.
    ///
    /// Dispatched when any collection is included or the list is empty.
    pub async fn dispatch_schema_change_event_for(
        &self,
        partition: &dyn Partition,
        ids: &[TableId],
        emitter: &dyn SchemaChangeEventEmitter,
    ) -> Result<()> {
        let any_included = ids.is_empty() || ids.iter().any(|id| self.filter.is_included(id));
        if !any_included && !self.keeps_non_captured_history() {
            trace!(tables = ?ids, "Filtering schema change event");
            return Ok(());
        }
        for event in emitter.emit_schema_change_events()? {
            self.schema_change_event(event).await?;
        }
        if ids.is_empty() {
            self.incremental.process_schema_change(partition, None).await?;
        }
        for id in ids {
            self.incremental
                .process_schema_change(partition, Some(id))
                .await?;
        }
        Ok(())
    }

    fn keeps_non_captured_history(&self) -> bool {
        self.schema.is_historized() && !self.schema.store_only_captured_tables()
    }

    async fn schema_change_event(&self, event: SchemaChangeEvent) -> Result<()> {
        if self.schema.is_historized() {
            self.schema.apply_schema_change(&event)?;
        }
        self.stats.schema_changes.fetch_add(1, Ordering::Relaxed);

        if !self.config.include_schema_changes {
            return Ok(());
        }
        debug!(
            database = %event.database,
            change = %event.change_type,
            "Emitting schema change record"
        );
        let record = OutputRecord {
            source_partition: event.source_partition.clone(),
            source_offset: event.source_offset.clone(),
            topic: self.topics.schema_change_topic(),
            kafka_partition: Some(0),
            key_schema: None,
            key: Some(event.record_key()),
            value_schema: None,
            value: Some(event.record_value()),
            timestamp: Some(event.timestamp.timestamp_millis()),
            headers: Default::default(),
        };
        self.queue.enqueue(record).await
    }

    // ------------------------------------------------------------------------
    // Heartbeats and notifications
    // ------------------------------------------------------------------------

    pub fn heartbeats_enabled(&self) -> bool {
        self.heartbeat.is_enabled()
    }

    /// Emit a heartbeat if one is due.
    pub async fn dispatch_heartbeat_event(
        &self,
        partition: &dyn Partition,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.heartbeat
            .heartbeat(&partition.source_partition(), offset.offset(), &self.queue)
            .await
            .map(|_| ())
    }

    /// Emit a heartbeat regardless of the schedule.
    pub async fn always_dispatch_heartbeat_event(
        &self,
        partition: &dyn Partition,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.heartbeat
            .force_heartbeat(&partition.source_partition(), offset.offset(), &self.queue)
            .await
    }

    pub async fn dispatch_heartbeat_event_also_to_incremental_snapshot(
        &self,
        partition: &dyn Partition,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.incremental.process_heartbeat(partition, offset).await?;
        self.dispatch_heartbeat_event(partition, offset).await
    }

    /// Server-side heartbeat: only the incremental snapshot is told.
    pub async fn dispatch_server_heartbeat_event(
        &self,
        partition: &dyn Partition,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.incremental.process_heartbeat(partition, offset).await
    }

    pub async fn enqueue_notification(&self, record: OutputRecord) -> Result<()> {
        self.queue.enqueue(record).await
    }

    pub fn dispatch_connector_event(&self, partition: &dyn Partition, event: &serde_json::Value) {
        self.listener.on_connector_event(partition, event);
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`EventDispatcher`].
pub struct EventDispatcherBuilder {
    config: ConnectorConfig,
    schema: Arc<dyn DatabaseSchema>,
    queue: Arc<ChangeEventQueue>,
    task_context: Option<CdcSourceTaskContext>,
    inconsistent_schema_handler: Arc<dyn InconsistentSchemaHandler>,
    signal_processor: Option<Arc<SignalProcessor>>,
    post_processors: Vec<Arc<dyn PostProcessor>>,
    listener: Arc<dyn DataChangeEventListener>,
    incremental: Arc<dyn IncrementalSnapshotChangeEventSource>,
}

impl EventDispatcherBuilder {
    /// Task identity used for extended headers.
    pub fn task_context(mut self, context: CdcSourceTaskContext) -> Self {
        self.task_context = Some(context);
        self
    }

    pub fn inconsistent_schema_handler(
        mut self,
        handler: Arc<dyn InconsistentSchemaHandler>,
    ) -> Self {
        self.inconsistent_schema_handler = handler;
        self
    }

    pub fn signal_processor(mut self, processor: Arc<SignalProcessor>) -> Self {
        self.signal_processor = Some(processor);
        self
    }

    pub fn post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processors.push(processor);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn DataChangeEventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn incremental_snapshot_source(
        mut self,
        source: Arc<dyn IncrementalSnapshotChangeEventSource>,
    ) -> Self {
        self.incremental = source;
        self
    }

    pub fn build(self) -> Result<EventDispatcher> {
        self.config.validate()?;
        let filter = self.config.table_filter()?;
        let topics = TopicNamingStrategy::from_config(&self.config);

        let extended_headers = match (&self.task_context, self.config.extended_headers_enabled) {
            (Some(context), true) => context.extended_headers(),
            _ => Default::default(),
        };
        let builder = Arc::new(
            RecordBuilder::new(self.queue.clone(), topics.clone())
                .with_post_processors(self.post_processors)
                .with_extended_headers(extended_headers)
                .with_tombstones_on_delete(self.config.emit_tombstones_on_delete),
        );

        let transaction_monitor = TransactionMonitor::new(
            self.config.provide_transaction_metadata,
            topics.transaction_topic(),
            self.queue.clone(),
        );
        let heartbeat = Heartbeat::new(&self.config, &topics);

        Ok(EventDispatcher {
            skipped_operations: self.config.skipped_operation_set(),
            streaming_receiver: StreamingChangeRecordReceiver::new(builder.clone()),
            config: self.config,
            schema: self.schema,
            queue: self.queue,
            filter,
            topics,
            builder,
            inconsistent_schema_handler: self.inconsistent_schema_handler,
            transaction_monitor,
            heartbeat,
            signal_processor: self.signal_processor,
            listener: self.listener,
            incremental: self.incremental,
            stats: Arc::new(DispatcherStats::default()),
        })
    }
}
