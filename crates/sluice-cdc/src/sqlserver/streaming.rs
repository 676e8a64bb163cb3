//! SQL Server streaming source
//!
//! Poll loop tying the [`PositionLedger`], the [`ChangeStreamReader`] and the
//! [`EventDispatcher`] together. One iteration per captured database:
//!
//! ```text
//! max_position ──► window (last, to] ──► new change tables?
//!                                             │
//!        ┌────────────────────────────────────┘
//!        ▼
//! read every change table ──► merge by (position, seq, op)
//!                                   │
//!                                   ▼
//!        BEGIN/END on commit change, dispatch, advance offset
//! ```
//!
//! The offset moves only after the dispatcher has queued a change, so a
//! failed read or dispatch resumes exactly after the last queued change.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut source = SqlServerStreamingSource::new(config, change_log, dispatcher)?;
//! source.start().await?;
//! // ...
//! source.stop().await?;
//! ```

use super::change_table::{ChangeRow, ChangeTable, RowOperation};
use super::config::SqlServerConnectorConfig;
use super::emitter::SqlServerChangeRecordEmitter;
use super::ledger::PositionLedger;
use super::log::{ChangeLog, ChangeRowStream};
use super::lsn::{Lsn, TxLogPosition};
use super::offset::{SqlServerOffsetContext, SqlServerPartition};
use super::reader::ChangeStreamReader;
use crate::common::{
    render_offset, CdcError, CdcSource, CdcSourceTaskContext, DataCollectionFilter,
    EventDispatcher, OffsetContext, OffsetMap, Partition, Result, SchemaChangeEvent, TableChange,
    TableId, TaskState,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

// ============================================================================
// Metrics
// ============================================================================

/// Streaming metrics
///
/// Thread-safe counters. Use [`SqlServerStreamingSource::metrics()`] to get
/// a snapshot.
#[derive(Default)]
pub struct SqlServerMetrics {
    /// Changes handed to the dispatcher
    events_captured: AtomicU64,
    poll_cycles: AtomicU64,
    /// Poll cycles that dispatched nothing
    empty_polls: AtomicU64,
    total_poll_time_ms: AtomicU64,
    last_poll_duration_ms: AtomicU64,
    capture_instances: AtomicU64,
    read_failures: AtomicU64,
    rediscoveries: AtomicU64,
}

impl SqlServerMetrics {
    fn record_event(&self) {
        self.events_captured.fetch_add(1, Ordering::Relaxed);
    }

    fn record_poll(&self, duration: Duration, events: usize) {
        self.poll_cycles.fetch_add(1, Ordering::Relaxed);
        let ms = duration.as_millis() as u64;
        self.total_poll_time_ms.fetch_add(ms, Ordering::Relaxed);
        self.last_poll_duration_ms.store(ms, Ordering::Relaxed);
        if events == 0 {
            self.empty_polls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn set_capture_instances(&self, count: usize) {
        self.capture_instances.store(count as u64, Ordering::Relaxed);
    }

    /// Export metrics snapshot
    pub fn snapshot(&self) -> SqlServerMetricsSnapshot {
        let cycles = self.poll_cycles.load(Ordering::Relaxed);
        SqlServerMetricsSnapshot {
            events_captured: self.events_captured.load(Ordering::Relaxed),
            poll_cycles: cycles,
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            avg_poll_time_ms: if cycles > 0 {
                self.total_poll_time_ms.load(Ordering::Relaxed) / cycles
            } else {
                0
            },
            last_poll_duration_ms: self.last_poll_duration_ms.load(Ordering::Relaxed),
            capture_instances: self.capture_instances.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            rediscoveries: self.rediscoveries.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot for external export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlServerMetricsSnapshot {
    pub events_captured: u64,
    pub poll_cycles: u64,
    pub empty_polls: u64,
    pub avg_poll_time_ms: u64,
    pub last_poll_duration_ms: u64,
    pub capture_instances: u64,
    pub read_failures: u64,
    pub rediscoveries: u64,
}

// ============================================================================
// Per-database state
// ============================================================================

struct DatabaseState {
    partition: SqlServerPartition,
    offset: Arc<SqlServerOffsetContext>,
    /// Capture instances being read, `None` until (re)discovered
    tables: Option<Vec<ChangeTable>>,
    /// Capture instance per known source table
    known: HashMap<TableId, String>,
    /// Commit LSN of the transaction whose BEGIN was dispatched
    open_transaction: Option<Lsn>,
    initialized: bool,
}

/// Next row of one change table in the merge.
struct Pending {
    key: (Lsn, Lsn, i32),
    table: usize,
    row: ChangeRow,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.key, self.table).cmp(&(other.key, other.table))
    }
}

// ============================================================================
// Streaming source
// ============================================================================

struct Inner {
    config: SqlServerConnectorConfig,
    ledger: Arc<PositionLedger>,
    reader: ChangeStreamReader,
    dispatcher: Arc<EventDispatcher>,
    filter: DataCollectionFilter,
    databases: Mutex<Vec<DatabaseState>>,
    metrics: SqlServerMetrics,
    context: CdcSourceTaskContext,
    running: AtomicBool,
    healthy: AtomicBool,
    shutdown: Notify,
    /// Cause that stopped the background loop
    failure: parking_lot::Mutex<Option<CdcError>>,
}

/// Poll-based change streaming for one or more SQL Server databases.
pub struct SqlServerStreamingSource {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SqlServerStreamingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerStreamingSource")
            .field("config", &self.inner.config)
            .field("state", &self.inner.context.state())
            .finish_non_exhaustive()
    }
}

impl SqlServerStreamingSource {
    pub fn new(
        config: SqlServerConnectorConfig,
        log: Arc<dyn ChangeLog>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let filter = config.connector.table_filter()?;
        let ledger = Arc::new(PositionLedger::new(log));
        let reader = ChangeStreamReader::new(ledger.clone(), config.data_query_mode)
            .with_skipped_operations(&config.connector.skipped_operations);
        let server = config.server_name().to_string();
        let databases = config
            .database_names
            .iter()
            .map(|db| DatabaseState {
                partition: SqlServerPartition::new(&server, db),
                offset: Arc::new(SqlServerOffsetContext::new(&server, db)),
                tables: None,
                known: HashMap::new(),
                open_transaction: None,
                initialized: false,
            })
            .collect();
        let context = CdcSourceTaskContext::new("sqlserver", &server, "0");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                ledger,
                reader,
                dispatcher,
                filter,
                databases: Mutex::new(databases),
                metrics: SqlServerMetrics::default(),
                context,
                running: AtomicBool::new(false),
                healthy: AtomicBool::new(false),
                shutdown: Notify::new(),
                failure: parking_lot::Mutex::new(None),
            }),
            handle: None,
        })
    }

    /// Resume a database from a stored offset map.
    pub async fn restore_offset(&self, database: &str, offset: &OffsetMap) -> Result<()> {
        let mut databases = self.inner.databases.lock().await;
        let state = databases
            .iter_mut()
            .find(|s| s.partition.database_name() == database)
            .ok_or_else(|| CdcError::config(format!("Database '{}' is not captured", database)))?;
        state.offset = Arc::new(SqlServerOffsetContext::from_offset(&state.partition, offset)?);
        state.initialized = false;
        info!(database, offset = %render_offset(offset), "Restored stored offset");
        Ok(())
    }

    pub fn partitions(&self) -> Vec<SqlServerPartition> {
        self.inner
            .config
            .database_names
            .iter()
            .map(|db| SqlServerPartition::new(self.inner.config.server_name(), db))
            .collect()
    }

    /// Current offset map of a database.
    pub async fn offset(&self, database: &str) -> Option<OffsetMap> {
        let databases = self.inner.databases.lock().await;
        databases
            .iter()
            .find(|s| s.partition.database_name() == database)
            .map(|s| s.offset.offset())
    }

    /// Last processed position of a database.
    pub async fn position(&self, database: &str) -> Option<TxLogPosition> {
        let databases = self.inner.databases.lock().await;
        databases
            .iter()
            .find(|s| s.partition.database_name() == database)
            .map(|s| s.offset.position())
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.inner.ledger
    }

    pub fn task_context(&self) -> &CdcSourceTaskContext {
        &self.inner.context
    }

    pub fn metrics(&self) -> SqlServerMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Run one iteration over every database; returns the changes dispatched.
    pub async fn poll_once(&self) -> Result<usize> {
        self.inner.poll_once().await
    }

    /// Message of the error that stopped the background loop, if any.
    ///
    /// The error itself is returned by the next [`CdcSource::stop`].
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().as_ref().map(ToString::to_string)
    }
}

impl Inner {
    /// Attach the current offsets to a fatal loop error.
    async fn fatal(&self, e: CdcError) -> CdcError {
        if matches!(e, CdcError::EventProcessing { .. }) {
            return e;
        }
        let databases = self.databases.lock().await;
        let offsets = databases
            .iter()
            .map(|s| format!("{}: {}", s.partition.database_name(), s.offset.describe()))
            .collect::<Vec<_>>()
            .join(", ");
        CdcError::event_processing(offsets, e)
    }

    async fn poll_once(&self) -> Result<usize> {
        let started = Instant::now();
        let mut databases = self.databases.lock().await;
        let mut dispatched = 0;
        for state in databases.iter_mut() {
            let span = tracing::debug_span!("poll", partition = %state.partition.id());
            match self.poll_database(state).instrument(span).await {
                Ok(n) => dispatched += n,
                Err(CdcError::ChangeTableGone { capture_instance }) => {
                    warn!(
                        database = %state.partition.database_name(),
                        capture_instance = %capture_instance,
                        "Change table dropped, rediscovering"
                    );
                    self.metrics.rediscoveries.fetch_add(1, Ordering::Relaxed);
                    state.tables = None;
                }
                Err(e) => {
                    if e.is_retriable() {
                        self.metrics.read_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    self.metrics.record_poll(started.elapsed(), dispatched);
                    return Err(e);
                }
            }
        }
        self.metrics.record_poll(started.elapsed(), dispatched);
        Ok(dispatched)
    }

    async fn initialize(&self, state: &mut DatabaseState) -> Result<bool> {
        let database = state.partition.database_name().to_string();
        if !self.ledger.is_agent_running(&database).await? {
            warn!(database = %database, "SQL Server Agent is not running, no new changes will be captured");
        }

        if state.offset.position().commit_lsn.is_available() {
            if !self
                .ledger
                .validate_log_position(&state.partition, &state.offset)
                .await?
            {
                return Err(CdcError::not_available(format!(
                    "Stored position {} of database '{}' is no longer available in the change tables",
                    state.offset.position(),
                    database
                )));
            }
            info!(database = %database, position = %state.offset.position(), "Resuming streaming");
        } else {
            let max = match self.ledger.max_position(&database).await {
                Ok(max) => max,
                Err(CdcError::NotAvailable(msg)) => {
                    debug!(database = %database, reason = %msg, "No maximum LSN yet");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            state
                .offset
                .set_position(TxLogPosition::at_commit(max), 0, 0);
            info!(database = %database, position = %max, "Starting streaming at current maximum LSN");
        }
        state.initialized = true;
        Ok(true)
    }

    async fn poll_database(&self, state: &mut DatabaseState) -> Result<usize> {
        if !state.initialized && !self.initialize(state).await? {
            return Ok(0);
        }
        let database = state.partition.database_name().to_string();
        if state.tables.is_none() {
            self.discover(state).await?;
        }

        let max = match self.ledger.max_position(&database).await {
            Ok(max) => max,
            Err(CdcError::NotAvailable(msg)) => {
                warn!(database = %database, reason = %msg, "No maximum LSN recorded in the database");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let last = state.offset.position();
        if max <= last.commit_lsn && !last.change_lsn.is_available() {
            trace!(database = %database, "No change in the database");
            self.dispatcher
                .dispatch_heartbeat_event(&state.partition, &*state.offset)
                .await?;
            return Ok(0);
        }

        let to = self.window_end(&database, &last, max).await?;
        let (from, from_seq, from_op) = if last.change_lsn.is_available() {
            (last.commit_lsn, last.change_lsn, state.offset.operation())
        } else {
            (
                self.ledger.next_position(&database, &last.commit_lsn).await?,
                Lsn::ZERO,
                0,
            )
        };
        debug!(database = %database, %from, %to, "Streaming window");

        for table in self
            .ledger
            .new_change_tables_between(&database, &from, &to)
            .await?
        {
            let known = state
                .tables
                .as_ref()
                .map_or(false, |t| t.iter().any(|k| k.capture_instance == table.capture_instance));
            if !known && self.filter.is_included(&table.source_table) {
                info!(table = %table, "Picking up new change table");
                self.add_table(state, table).await?;
            }
        }

        let dispatched = self
            .stream_window(state, &from, &from_seq, from_op, &to)
            .await?;

        if let Some(commit) = state.open_transaction.take() {
            trace!(commit = %commit, "Committing transaction at end of window");
            self.dispatcher
                .dispatch_transaction_committed_event(&state.partition, &*state.offset, Utc::now())
                .await?;
        }
        state.offset.set_position(TxLogPosition::at_commit(to), 0, 0);
        self.dispatcher
            .dispatch_heartbeat_event(&state.partition, &*state.offset)
            .await?;
        Ok(dispatched)
    }

    /// Upper bound of this iteration's window.
    async fn window_end(&self, database: &str, last: &TxLogPosition, max: Lsn) -> Result<Lsn> {
        let n = self.config.max_transactions_per_iteration;
        if n == 0 {
            return Ok(max);
        }
        let nth = self
            .ledger
            .nth_transaction_from_last(database, &last.commit_lsn, n)
            .await?;
        if nth.is_available() && nth > last.commit_lsn && nth < max {
            Ok(nth)
        } else {
            Ok(max)
        }
    }

    async fn discover(&self, state: &mut DatabaseState) -> Result<()> {
        let database = state.partition.database_name().to_string();
        let tables = self.ledger.discover_change_tables(&database, None).await?;
        state.tables = Some(Vec::new());
        for table in tables {
            if self.filter.is_included(&table.source_table) {
                self.add_table(state, table).await?;
            } else {
                trace!(table = %table.source_table, "Excluded change table");
            }
        }
        let count = state.tables.as_ref().map_or(0, Vec::len);
        self.metrics.set_capture_instances(count);
        info!(database = %database, capture_instances = count, "Change tables discovered");
        Ok(())
    }

    /// Start reading a capture instance and publish its structure.
    async fn add_table(&self, state: &mut DatabaseState, table: ChangeTable) -> Result<()> {
        let schema = self.ledger.change_log().table_schema(&table).await?;
        let id = table.source_table.clone();
        let change = match state.known.get(&id) {
            None => Some(TableChange::create(id.clone(), schema.columns, schema.key_columns)),
            Some(capture) if *capture != table.capture_instance => {
                Some(TableChange::alter(id.clone(), schema.columns, schema.key_columns))
            }
            Some(_) => None,
        };
        if let Some(change) = change {
            let event = SchemaChangeEvent::new(id.catalog.clone(), change.change_type)
                .with_position(state.partition.source_partition(), state.offset.offset())
                .with_source(state.offset.source_info())
                .with_schema(id.schema.clone())
                .with_table_change(change);
            self.dispatcher
                .dispatch_schema_change_event(&state.partition, Some(&id), &event)
                .await?;
        }
        state.known.insert(id, table.capture_instance.clone());

        let tables = state.tables.get_or_insert_with(Vec::new);
        tables.retain(|t| t.capture_instance != table.capture_instance);
        tables.push(table);
        link_capture_instances(tables);
        self.metrics.set_capture_instances(tables.len());
        Ok(())
    }

    async fn stream_window(
        &self,
        state: &mut DatabaseState,
        from: &Lsn,
        from_seq: &Lsn,
        from_op: i32,
        to: &Lsn,
    ) -> Result<usize> {
        let tables: Vec<ChangeTable> = state
            .tables
            .as_ref()
            .map(|t| t.iter().filter(|t| t.start_lsn <= *to).cloned().collect())
            .unwrap_or_default();

        let mut streams: Vec<ChangeRowStream> = Vec::with_capacity(tables.len());
        let mut heap = BinaryHeap::new();
        for (i, table) in tables.iter().enumerate() {
            let mut stream = self
                .reader
                .read(table, from, from_seq, from_op, to, 0)
                .await?;
            if let Some(row) = stream.try_next().await? {
                heap.push(Reverse(Pending {
                    key: row.order_key(),
                    table: i,
                    row,
                }));
            }
            streams.push(stream);
        }

        let mut dispatched = 0;
        while let Some(Reverse(Pending { table: i, row, .. })) = heap.pop() {
            let after_image = if row.row_operation() == Some(RowOperation::UpdateBefore) {
                streams[i].try_next().await?
            } else {
                None
            };
            if let Some(next) = streams[i].try_next().await? {
                heap.push(Reverse(Pending {
                    key: next.order_key(),
                    table: i,
                    row: next,
                }));
            }

            let table = &tables[i];
            if !table.covers(&row.commit_lsn) {
                trace!(table = %table.capture_instance, lsn = %row.commit_lsn, "Change past capture instance stop");
                continue;
            }
            self.dispatch_row(state, table, &row, after_image.as_ref())
                .await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn dispatch_row(
        &self,
        state: &mut DatabaseState,
        table: &ChangeTable,
        row: &ChangeRow,
        after_image: Option<&ChangeRow>,
    ) -> Result<()> {
        let commit_time = row.commit_time.unwrap_or_else(Utc::now);
        if state.open_transaction != Some(row.commit_lsn) {
            if state.open_transaction.take().is_some() {
                self.dispatcher
                    .dispatch_transaction_committed_event(&state.partition, &*state.offset, commit_time)
                    .await?;
            }
            let begin = state.offset.at_change(
                TxLogPosition::at_commit(row.commit_lsn),
                0,
                0,
                &table.source_table,
                row.commit_time,
            );
            self.dispatcher
                .dispatch_transaction_started_event(
                    &state.partition,
                    &row.commit_lsn.to_string(),
                    &*begin,
                    commit_time,
                )
                .await?;
            state.open_transaction = Some(row.commit_lsn);
        }

        let position = row.position();
        let serial = if state.offset.position() == position {
            state.offset.event_serial_no() + 1
        } else {
            1
        };
        let operation = after_image.map_or(row.operation, |a| a.operation);
        let change = state.offset.at_change(
            position,
            operation,
            serial,
            &table.source_table,
            row.commit_time,
        );
        let emitter = SqlServerChangeRecordEmitter::from_rows(change.clone(), table, row, after_image)?;
        self.dispatcher
            .dispatch_data_change_event(&state.partition, &table.source_table, &emitter)
            .await?;

        state.offset.advance_to(&change);
        self.metrics.record_event();
        Ok(())
    }
}

/// Close each capture instance at the start of its successor.
fn link_capture_instances(tables: &mut [ChangeTable]) {
    let mut by_source: BTreeMap<TableId, Vec<usize>> = BTreeMap::new();
    for (i, table) in tables.iter().enumerate() {
        by_source.entry(table.source_table.clone()).or_default().push(i);
    }
    for indexes in by_source.values_mut() {
        indexes.sort_by_key(|&i| tables[i].start_lsn);
        for pair in indexes.windows(2) {
            tables[pair[0]].stop_lsn = tables[pair[1]].start_lsn;
        }
        if let Some(&last) = indexes.last() {
            tables[last].stop_lsn = Lsn::NULL;
        }
    }
}

#[async_trait]
impl CdcSource for SqlServerStreamingSource {
    async fn start(&mut self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(CdcError::invalid_state("SQL Server streaming already running"));
        }
        info!(
            server = %self.inner.config.server_name(),
            databases = ?self.inner.config.database_names,
            "Starting SQL Server streaming"
        );
        self.inner.context.set_state(TaskState::Running);
        self.inner.healthy.store(true, Ordering::SeqCst);
        self.inner.failure.lock().take();

        let inner = self.inner.clone();
        self.handle = Some(tokio::spawn(async move {
            let poll_interval = inner.config.poll_interval();
            while inner.running.load(Ordering::SeqCst) {
                let dispatched = match inner.poll_once().await {
                    Ok(n) => {
                        inner.healthy.store(true, Ordering::SeqCst);
                        n
                    }
                    Err(e) if e.is_retriable() => {
                        warn!(error = %e, "Streaming poll failed, retrying");
                        inner.healthy.store(false, Ordering::SeqCst);
                        0
                    }
                    Err(e) => {
                        let failure = inner.fatal(e).await;
                        error!(error = %failure, "Streaming stopped");
                        inner.healthy.store(false, Ordering::SeqCst);
                        inner.running.store(false, Ordering::SeqCst);
                        *inner.failure.lock() = Some(failure);
                        break;
                    }
                };
                if dispatched == 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = inner.shutdown.notified() => {}
                    }
                }
            }
            inner.context.set_state(TaskState::Stopped);
            debug!("Streaming loop exited");
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| CdcError::other(format!("Streaming task failed: {}", e)))?;
        }
        self.inner.healthy.store(false, Ordering::SeqCst);
        self.inner.context.set_state(TaskState::Stopped);
        if let Some(failure) = self.inner.failure.lock().take() {
            return Err(failure);
        }
        info!("SQL Server streaming stopped");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && self.inner.healthy.load(Ordering::SeqCst)
    }

    fn state(&self) -> TaskState {
        self.inner.context.state()
    }
}

impl Drop for SqlServerStreamingSource {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
    }
}
