//! # Incremental Snapshots
//!
//! Hooks the dispatcher calls so a chunked re-snapshot can run while
//! streaming continues, plus [`ChunkWindow`], a watermark-based
//! deduplication tracker.
//!
//! ## Watermark-Based Deduplication (DBLog Algorithm)
//!
//! ```text
//! Timeline:
//! ────────────────────────────────────────────────────────────────►
//!     │         │                     │         │
//!     │  OPEN   │   Chunk Query       │  CLOSE  │
//!     │ Window  │   (buffer results)  │ Window  │
//!     │         │                     │         │
//!
//! During window:
//! - Snapshot rows go into memory buffer
//! - Streaming events with matching keys drop buffer entries
//! - On window close: remaining buffer entries are emitted as READ events
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let window = Arc::new(ChunkWindow::new());
//! dispatcher.set_incremental_snapshot_source(window.clone());
//!
//! window.open_window("chunk-1", orders_id.clone());
//! for row in execute_chunk_query().await? {
//!     window.buffer_row(row.key, row.value);
//! }
//! let receiver = dispatcher.incremental_snapshot_change_event_receiver(listener);
//! for row in window.close_window() {
//!     receiver.change_record(&partition, &schema, row.into_change(), offset.clone()).await?;
//! }
//! ```

use crate::common::emitter::EmittedChange;
use crate::common::event::{Headers, Operation};
use crate::common::offset::{OffsetContext, OffsetMap, Partition};
use crate::common::schema::TableId;
use crate::common::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Notifications the dispatcher sends to the incremental snapshot sub-process.
///
/// Every method except [`process_message`](Self::process_message) defaults to
/// a no-op.
#[async_trait]
pub trait IncrementalSnapshotChangeEventSource: Send + Sync {
    /// A data event for `id` was dispatched.
    async fn process_message(
        &self,
        partition: &dyn Partition,
        id: &TableId,
        key: Option<&Value>,
        offset: &dyn OffsetContext,
    ) -> Result<()>;

    /// A filtered event advanced the position without producing output.
    async fn process_filtered_event(
        &self,
        _partition: &dyn Partition,
        _offset: &dyn OffsetContext,
    ) -> Result<()> {
        Ok(())
    }

    async fn process_transaction_started(
        &self,
        _partition: &dyn Partition,
        _offset: &dyn OffsetContext,
    ) -> Result<()> {
        Ok(())
    }

    async fn process_transaction_committed(
        &self,
        _partition: &dyn Partition,
        _offset: &dyn OffsetContext,
    ) -> Result<()> {
        Ok(())
    }

    /// A schema change was dispatched. `id` is `None` for database-level changes.
    async fn process_schema_change(
        &self,
        _partition: &dyn Partition,
        _id: Option<&TableId>,
    ) -> Result<()> {
        Ok(())
    }

    async fn process_heartbeat(
        &self,
        _partition: &dyn Partition,
        _offset: &dyn OffsetContext,
    ) -> Result<()> {
        Ok(())
    }
}

/// Source used when no incremental snapshot is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIncrementalSnapshot;

#[async_trait]
impl IncrementalSnapshotChangeEventSource for NoIncrementalSnapshot {
    async fn process_message(
        &self,
        _partition: &dyn Partition,
        _id: &TableId,
        _key: Option<&Value>,
        _offset: &dyn OffsetContext,
    ) -> Result<()> {
        Ok(())
    }
}

/// A chunk row that survived its window.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: TableId,
    pub key: Value,
    /// Full envelope value, emitted as a READ
    pub value: Value,
    key_text: String,
}

impl ChunkRow {
    /// Convert into a READ change tuple for the incremental receiver.
    pub fn into_change(self) -> EmittedChange {
        EmittedChange {
            operation: Operation::Read,
            key: Some(self.key),
            value: self.value,
            headers: Headers::new(),
        }
    }
}

/// Chunk window statistics.
#[derive(Debug, Default)]
pub struct ChunkWindowStats {
    windows_opened: AtomicU64,
    rows_buffered: AtomicU64,
    rows_dropped: AtomicU64,
    rows_emitted: AtomicU64,
    commits_seen: AtomicU64,
}

impl ChunkWindowStats {
    pub fn windows_opened(&self) -> u64 {
        self.windows_opened.load(Ordering::Relaxed)
    }

    pub fn rows_buffered(&self) -> u64 {
        self.rows_buffered.load(Ordering::Relaxed)
    }

    /// Buffered rows superseded by streamed events
    pub fn rows_dropped(&self) -> u64 {
        self.rows_dropped.load(Ordering::Relaxed)
    }

    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted.load(Ordering::Relaxed)
    }

    pub fn commits_seen(&self) -> u64 {
        self.commits_seen.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct OpenWindow {
    chunk_id: String,
    collection: TableId,
    rows: Vec<ChunkRow>,
    keys: HashSet<String>,
    opened_at: Instant,
    /// The collection's schema changed while the window was open
    invalidated: bool,
}

/// Watermark window over one chunk of one collection.
#[derive(Debug, Default)]
pub struct ChunkWindow {
    window: Mutex<Option<OpenWindow>>,
    /// Offset of the last event seen, filtered or not
    last_seen_offset: Mutex<Option<OffsetMap>>,
    stats: ChunkWindowStats,
}

impl ChunkWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &ChunkWindowStats {
        &self.stats
    }

    /// Open a window, discarding any rows left from a previous one.
    pub fn open_window(&self, chunk_id: impl Into<String>, collection: TableId) {
        let chunk_id = chunk_id.into();
        debug!(chunk_id = %chunk_id, table = %collection, "Snapshot window opened");
        *self.window.lock() = Some(OpenWindow {
            chunk_id,
            collection,
            rows: Vec::new(),
            keys: HashSet::new(),
            opened_at: Instant::now(),
            invalidated: false,
        });
        self.stats.windows_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Buffer one chunk row. Ignored when no window is open.
    ///
    /// A second row with the same key replaces the first.
    pub fn buffer_row(&self, key: Value, value: Value) -> bool {
        let mut guard = self.window.lock();
        let Some(window) = guard.as_mut() else {
            return false;
        };
        let key_text = key.to_string();
        if !window.keys.insert(key_text.clone()) {
            window.rows.retain(|r| r.key_text != key_text);
        }
        window.rows.push(ChunkRow {
            id: window.collection.clone(),
            key,
            value,
            key_text,
        });
        self.stats.rows_buffered.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn is_window_open(&self) -> bool {
        self.window.lock().is_some()
    }

    /// Rows currently buffered.
    pub fn len(&self) -> usize {
        self.window.lock().as_ref().map(|w| w.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the most recent streamed or filtered event.
    pub fn last_seen_offset(&self) -> Option<OffsetMap> {
        self.last_seen_offset.lock().clone()
    }

    /// Close the window and return the surviving rows in buffer order.
    ///
    /// Returns nothing when the collection's schema changed while the window
    /// was open; the chunk must be read again.
    pub fn close_window(&self) -> Vec<ChunkRow> {
        let Some(window) = self.window.lock().take() else {
            return Vec::new();
        };
        if window.invalidated {
            warn!(
                chunk_id = %window.chunk_id,
                table = %window.collection,
                "Schema changed during snapshot window; chunk discarded"
            );
            return Vec::new();
        }
        debug!(
            chunk_id = %window.chunk_id,
            table = %window.collection,
            emitted = window.rows.len(),
            duration_ms = window.opened_at.elapsed().as_millis() as u64,
            "Snapshot window closed"
        );
        self.stats
            .rows_emitted
            .fetch_add(window.rows.len() as u64, Ordering::Relaxed);
        window.rows
    }

    fn observe(&self, offset: &dyn OffsetContext) {
        *self.last_seen_offset.lock() = Some(offset.offset());
    }
}

#[async_trait]
impl IncrementalSnapshotChangeEventSource for ChunkWindow {
    async fn process_message(
        &self,
        _partition: &dyn Partition,
        id: &TableId,
        key: Option<&Value>,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.observe(offset);
        let Some(key) = key else {
            return Ok(());
        };
        let mut guard = self.window.lock();
        let Some(window) = guard.as_mut() else {
            return Ok(());
        };
        if &window.collection != id {
            return Ok(());
        }
        let key_text = key.to_string();
        if window.keys.remove(&key_text) {
            window.rows.retain(|r| r.key_text != key_text);
            self.stats.rows_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key_text,
                chunk_id = %window.chunk_id,
                "Dropped buffered snapshot row due to streaming conflict"
            );
        }
        Ok(())
    }

    async fn process_filtered_event(
        &self,
        _partition: &dyn Partition,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.observe(offset);
        Ok(())
    }

    async fn process_transaction_committed(
        &self,
        _partition: &dyn Partition,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.observe(offset);
        self.stats.commits_seen.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn process_schema_change(
        &self,
        _partition: &dyn Partition,
        id: Option<&TableId>,
    ) -> Result<()> {
        if let Some(window) = self.window.lock().as_mut() {
            if id.map_or(true, |id| id == &window.collection) {
                trace!(table = %window.collection, "Invalidating open snapshot window");
                window.invalidated = true;
            }
        }
        Ok(())
    }

    async fn process_heartbeat(
        &self,
        _partition: &dyn Partition,
        offset: &dyn OffsetContext,
    ) -> Result<()> {
        self.observe(offset);
        Ok(())
    }
}
