//! # SQL Server CDC Source
//!
//! Change data capture for Microsoft SQL Server, read from the change tables
//! the SQL Server Agent capture job fills (poll-based, not log streaming).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     SQL Server CDC Flow                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────┐    ┌──────────────┐    ┌─────────────────────┐    │
//! │  │ DML Ops  │───▶│ Transaction  │───▶│ CDC Capture Job     │    │
//! │  │ (I/U/D)  │    │ Log          │    │ (SQL Agent)         │    │
//! │  └──────────┘    └──────────────┘    └──────────┬──────────┘    │
//! │                                                  │              │
//! │                                                  ▼              │
//! │                                       ┌─────────────────────┐   │
//! │                                       │ cdc.<capture>_CT    │   │
//! │                                       │ Change Tables       │   │
//! │                                       └──────────┬──────────┘   │
//! │                                                  │ ChangeLog    │
//! │     ┌────────────────────────────────────────────┘              │
//! │     ▼                                                           │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ SqlServerStreamingSource                                   │ │
//! │  │                                                            │ │
//! │  │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐  │ │
//! │  │  │ Position     │───▶│ ChangeStream │───▶│ Event        │  │ │
//! │  │  │ Ledger       │    │ Reader       │    │ Dispatcher   │  │ │
//! │  │  └──────────────┘    └──────────────┘    └──────────────┘  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## CDC Table Structure
//!
//! For each capture instance SQL Server creates a change table with:
//!
//! | Column | Type | Description |
//! |--------|------|-------------|
//! | `__$start_lsn` | `binary(10)` | Commit LSN of the transaction |
//! | `__$seqval` | `binary(10)` | Sequence within transaction |
//! | `__$operation` | `int` | 1=Delete, 2=Insert, 3=Update(before), 4=Update(after) |
//! | `__$update_mask` | `varbinary` | Bitmask of updated columns |
//! | `__$command_id` | `int` | Order of operations within a transaction |
//! | `<columns>` | varies | Captured source columns |
//!
//! ## Position Tracking
//!
//! Progress is a [`TxLogPosition`] of `commit_lsn` + `change_lsn` plus the
//! operation code, so a read resumes strictly after the last change:
//!
//! ```text
//! (start_lsn, seqval, operation) > (commit_lsn, change_lsn, operation)
//!   AND start_lsn <= to
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sluice_cdc::common::{ChangeEventQueue, EventDispatcher, HistorizedSchema};
//! use sluice_cdc::sqlserver::{SqlServerChangeLog, SqlServerConnectorConfig, SqlServerStreamingSource};
//!
//! let config = SqlServerConnectorConfig::builder()
//!     .topic_prefix("srv1")
//!     .host("localhost")
//!     .username("sa")
//!     .password("YourPassword123!")
//!     .database("inventory")
//!     .build()?;
//!
//! let log = Arc::new(SqlServerChangeLog::connect(&config).await?);
//! let (queue, mut consumer) = ChangeEventQueue::new(config.connector.max_queue_size);
//! let dispatcher = EventDispatcher::builder(
//!     config.connector.clone(),
//!     Arc::new(HistorizedSchema::new()),
//!     queue,
//! )
//! .build()?;
//!
//! let mut source = SqlServerStreamingSource::new(config, log, Arc::new(dispatcher))?;
//! source.start().await?;
//!
//! while let Some(record) = consumer.recv().await {
//!     println!("{}: {:?}", record.topic, record.value);
//! }
//! ```
//!
//! ## SQL Server Requirements
//!
//! 1. **Enable CDC on database**:
//!    ```sql
//!    EXEC sys.sp_cdc_enable_db;
//!    ```
//!
//! 2. **Enable CDC on tables**:
//!    ```sql
//!    EXEC sys.sp_cdc_enable_table
//!        @source_schema = N'dbo',
//!        @source_name = N'orders',
//!        @role_name = NULL;
//!    ```
//!
//! 3. **SQL Server Agent must be running** (captures changes to CDC tables)
//!
//! The `sqlserver` feature enables the TDS-backed [`SqlServerChangeLog`];
//! everything else runs against any [`ChangeLog`], including the in-process
//! [`MemoryChangeLog`].

mod change_table;
mod config;
#[cfg(feature = "sqlserver")]
mod connection;
mod emitter;
mod error;
mod ledger;
mod log;
mod lsn;
mod memory;
mod offset;
mod query;
mod reader;
mod streaming;

pub use change_table::{
    change_table_name, CapturedColumn, ChangeRow, ChangeTable, ChangeTableEntry, RowOperation,
};
pub use config::{SqlServerConnectorConfig, SqlServerConnectorConfigBuilder};
#[cfg(feature = "sqlserver")]
pub use connection::SqlServerChangeLog;
pub use emitter::SqlServerChangeRecordEmitter;
pub use error::{SqlServerError, INVALID_OBJECT_NAME};
pub use ledger::PositionLedger;
pub use log::{ChangeLog, ChangeRowStream};
pub use lsn::{Lsn, TxLogPosition};
pub use memory::MemoryChangeLog;
pub use offset::{
    SqlServerOffsetContext, SqlServerPartition, CHANGE_LSN_KEY, COMMIT_LSN_KEY,
    DATABASE_PARTITION_KEY, EVENT_SERIAL_NO_KEY, OPERATION_KEY, SERVER_PARTITION_KEY,
    SNAPSHOT_COMPLETED_KEY, SNAPSHOT_KEY,
};
pub use query::{quote_identifier, ChangesQuery, DataQueryMode, QueryParam};
pub use reader::ChangeStreamReader;
pub use streaming::{SqlServerMetrics, SqlServerMetricsSnapshot, SqlServerStreamingSource};

// Re-export common types
pub use crate::common::{CdcSource, Operation};
