//! Data change event listeners
//!
//! Synchronous observer hooks called by the dispatcher for every event it
//! routes. Listeners must not block; they run on the producer's task.

use crate::common::event::{Operation, SchemaRef};
use crate::common::offset::{OffsetContext, Partition};
use crate::common::schema::TableId;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Observer of dispatched, filtered and erroneous events.
pub trait DataChangeEventListener: Send + Sync {
    /// A data event passed filtering and is about to be enqueued.
    fn on_event(
        &self,
        _partition: &dyn Partition,
        _id: &TableId,
        _offset: &dyn OffsetContext,
        _key: Option<&Value>,
        _value: &Value,
        _operation: Operation,
    ) {
    }

    /// An event was dropped by the include/exclude policy or by its emitter.
    fn on_filtered_event(
        &self,
        _partition: &dyn Partition,
        _description: &str,
        _operation: Option<Operation>,
    ) {
    }

    /// An event could not be processed.
    fn on_erroneous_event(
        &self,
        _partition: &dyn Partition,
        _description: &str,
        _operation: Option<Operation>,
    ) {
    }

    /// A connector-level event (not a data change).
    fn on_connector_event(&self, _partition: &dyn Partition, _event: &Value) {}

    /// A row produced by an incremental snapshot chunk.
    fn on_snapshot_row(
        &self,
        _partition: &dyn Partition,
        _id: &TableId,
        _key_schema: Option<&SchemaRef>,
        _value: &Value,
        _operation: Operation,
    ) {
    }
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventListener;

impl DataChangeEventListener for NoopEventListener {}

/// Listener that counts callbacks.
#[derive(Debug, Default)]
pub struct CountingEventListener {
    events: AtomicU64,
    filtered: AtomicU64,
    erroneous: AtomicU64,
    connector_events: AtomicU64,
    snapshot_rows: AtomicU64,
}

impl CountingEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    pub fn erroneous(&self) -> u64 {
        self.erroneous.load(Ordering::Relaxed)
    }

    pub fn connector_events(&self) -> u64 {
        self.connector_events.load(Ordering::Relaxed)
    }

    pub fn snapshot_rows(&self) -> u64 {
        self.snapshot_rows.load(Ordering::Relaxed)
    }
}

impl DataChangeEventListener for CountingEventListener {
    fn on_event(
        &self,
        _partition: &dyn Partition,
        _id: &TableId,
        _offset: &dyn OffsetContext,
        _key: Option<&Value>,
        _value: &Value,
        _operation: Operation,
    ) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    fn on_filtered_event(
        &self,
        _partition: &dyn Partition,
        _description: &str,
        _operation: Option<Operation>,
    ) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    fn on_erroneous_event(
        &self,
        _partition: &dyn Partition,
        _description: &str,
        _operation: Option<Operation>,
    ) {
        self.erroneous.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connector_event(&self, _partition: &dyn Partition, _event: &Value) {
        self.connector_events.fetch_add(1, Ordering::Relaxed);
    }

    fn on_snapshot_row(
        &self,
        _partition: &dyn Partition,
        _id: &TableId,
        _key_schema: Option<&SchemaRef>,
        _value: &Value,
        _operation: Operation,
    ) {
        self.snapshot_rows.fetch_add(1, Ordering::Relaxed);
    }
}
