//! Test harness for sluice-cdc integration tests
//!
//! In-memory change log fixtures and a wired dispatch pipeline, so tests
//! exercise the same code paths a live SQL Server source does.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use sluice_cdc::common::{
    ChangeEventQueue, ChangeEventQueueConsumer, ColumnDefinition, ConnectorConfigBuilder,
    CountingEventListener, DataCollectionSchema, EventDispatcher, EventDispatcherBuilder,
    HistorizedSchema, TableId,
};
use sluice_cdc::sqlserver::{
    ChangeRow, ChangeTableEntry, Lsn, MemoryChangeLog, RowOperation, SqlServerConnectorConfig,
    SqlServerStreamingSource,
};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("sluice_cdc=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const TEST_DB: &str = "testdb";
pub const SERVER: &str = "srv1";

/// LSN with `n` in the log-record offset.
pub fn lsn(n: u32) -> Lsn {
    Lsn::from_parts(0, n, 0)
}

pub fn orders_id() -> TableId {
    TableId::new(TEST_DB, "dbo", "orders")
}

pub fn customers_id() -> TableId {
    TableId::new(TEST_DB, "dbo", "customers")
}

/// `cdc.change_tables` row for a capture instance of `dbo.<table>`.
pub fn change_table_entry(
    table: &str,
    capture_instance: &str,
    object_id: i32,
    source_object_id: i32,
    start: u32,
) -> ChangeTableEntry {
    ChangeTableEntry {
        database: TEST_DB.to_string(),
        source_schema: "dbo".to_string(),
        source_table: table.to_string(),
        capture_instance: capture_instance.to_string(),
        object_id,
        source_object_id,
        start_lsn: lsn(start),
        create_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

pub fn orders_schema() -> DataCollectionSchema {
    DataCollectionSchema::new(
        orders_id(),
        vec![
            ColumnDefinition::new("id", "int", 1).not_null(),
            ColumnDefinition::new("name", "nvarchar(50)", 2),
        ],
        vec!["id".into()],
    )
}

pub fn customers_schema() -> DataCollectionSchema {
    DataCollectionSchema::new(
        customers_id(),
        vec![
            ColumnDefinition::new("id", "int", 1).not_null(),
            ColumnDefinition::new("email", "nvarchar(100)", 2),
        ],
        vec!["id".into()],
    )
}

/// Change log with `dbo.orders` (capture `dbo_orders`, start 100).
pub fn orders_log() -> Arc<MemoryChangeLog> {
    let log = Arc::new(MemoryChangeLog::new());
    log.create_change_table(
        change_table_entry("orders", "dbo_orders", 1001, 501, 100),
        &["id", "name"],
    );
    log.register_schema(orders_schema());
    log
}

pub fn row(pos: u32, seq: u32, op: RowOperation, id: i64, name: &str) -> ChangeRow {
    ChangeRow::new(lsn(pos), lsn(seq), op, vec![json!(id), json!(name)])
}

/// Commit one row to a capture instance of the test database.
pub fn write(log: &MemoryChangeLog, capture: &str, change: ChangeRow) {
    log.insert(TEST_DB, capture, change);
}

/// Dispatcher, queue consumer and listener wired over a fresh schema store.
pub struct Pipeline {
    pub dispatcher: Arc<EventDispatcher>,
    pub consumer: ChangeEventQueueConsumer,
    pub listener: Arc<CountingEventListener>,
    pub schema: Arc<HistorizedSchema>,
}

impl Pipeline {
    pub fn new(configure: impl FnOnce(ConnectorConfigBuilder) -> ConnectorConfigBuilder) -> Self {
        Self::wired(configure, |b| b)
    }

    /// Pipeline whose dispatcher builder is extended by `wire` (signals,
    /// incremental snapshot source, ...).
    pub fn wired(
        configure: impl FnOnce(ConnectorConfigBuilder) -> ConnectorConfigBuilder,
        wire: impl FnOnce(EventDispatcherBuilder) -> EventDispatcherBuilder,
    ) -> Self {
        let config = configure(
            sluice_cdc::common::ConnectorConfig::builder()
                .topic_prefix(SERVER)
                .emit_tombstones_on_delete(false),
        )
        .build()
        .unwrap();
        let (queue, consumer) = ChangeEventQueue::new(1024);
        let listener = Arc::new(CountingEventListener::new());
        let schema = Arc::new(HistorizedSchema::new());
        let dispatcher = wire(
            EventDispatcher::builder(config, schema.clone(), queue).listener(listener.clone()),
        )
        .build()
        .unwrap();
        Self {
            dispatcher: Arc::new(dispatcher),
            consumer,
            listener,
            schema,
        }
    }
}

/// Streaming source over `log` for the test database.
pub fn streaming_source(
    log: Arc<MemoryChangeLog>,
    configure: impl FnOnce(
        sluice_cdc::sqlserver::SqlServerConnectorConfigBuilder,
    ) -> sluice_cdc::sqlserver::SqlServerConnectorConfigBuilder,
) -> (SqlServerStreamingSource, Pipeline) {
    let config: SqlServerConnectorConfig = configure(
        SqlServerConnectorConfig::builder()
            .topic_prefix(SERVER)
            .database(TEST_DB)
            .poll_interval_ms(50)
            .connector(|c| c.emit_tombstones_on_delete(false)),
    )
    .build()
    .unwrap();

    let (queue, consumer) = ChangeEventQueue::new(1024);
    let listener = Arc::new(CountingEventListener::new());
    let schema = Arc::new(HistorizedSchema::new());
    let dispatcher = Arc::new(
        EventDispatcher::builder(config.connector.clone(), schema.clone(), queue)
            .listener(listener.clone())
            .build()
            .unwrap(),
    );
    let source = SqlServerStreamingSource::new(config, log, dispatcher.clone()).unwrap();
    (
        source,
        Pipeline {
            dispatcher,
            consumer,
            listener,
            schema,
        },
    )
}

/// `after` images of data change records, in queue order.
pub fn after_images(records: &[sluice_cdc::OutputRecord]) -> Vec<Value> {
    records
        .iter()
        .filter(|r| r.operation().is_some())
        .filter_map(|r| r.value.as_ref().map(|v| v["after"].clone()))
        .collect()
}
