//! # sluice-cdc - Change Data Capture core
//!
//! Poll-based change data capture for SQL Server change tables, feeding a
//! database-agnostic event dispatch pipeline.
//!
//! ## Features
//!
//! - `sqlserver` - TDS-backed change log via Tiberius
//!
//! Without features the crate runs against any [`sqlserver::ChangeLog`],
//! including the in-process [`sqlserver::MemoryChangeLog`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  ChangeLog   │──▶│  Position    │──▶│ ChangeStream │
//! │ (TDS/memory) │   │  Ledger      │   │ Reader       │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │ change rows
//!                                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │              SqlServerStreamingSource                    │
//! │   merge by (position, seq, op) ─▶ ChangeRecordEmitter    │
//! └────────────────────────────┬─────────────────────────────┘
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ EventDispatcher ─▶ Receiver ─▶ ChangeEventQueue          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Errors, operations, output records and the source lifecycle.
//!
//! ### Tier 2: Pipeline (crate root)
//! Dispatcher, queue, configuration and schema store.
//!
//! ### Tier 3: Advanced Types (`common` module)
//! Receivers, transaction monitor, signals and incremental snapshot
//! internals - accessed via `common::*`.

pub mod common;
pub mod sqlserver;

// =============================================================================
// TIER 1: Core CDC Types
// =============================================================================

pub use common::{
    CdcError, CdcSource, ErrorCategory, Headers, Operation, OutputRecord, Result, TaskState,
};

// =============================================================================
// TIER 2: Pipeline
// =============================================================================

pub use common::{
    ChangeEventQueue, ChangeEventQueueConsumer, ConnectorConfig, ConnectorConfigBuilder,
    EventDispatcher, EventDispatcherBuilder, EventProcessingFailureHandlingMode,
    HistorizedSchema, TableId,
};

pub use sqlserver::{
    ChangeStreamReader, Lsn, PositionLedger, SqlServerConnectorConfig, SqlServerStreamingSource,
    TxLogPosition,
};
