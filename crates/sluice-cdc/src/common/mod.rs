//! # Common CDC Types and Traits
//!
//! Database-agnostic half of the pipeline:
//!
//! - [`EventDispatcher`] - Filtering, bookkeeping and routing of change events
//! - [`ChangeEventQueue`] - Bounded outbound queue with backpressure
//! - Receivers ([`StreamingChangeRecordReceiver`], [`BufferingSnapshotChangeRecordReceiver`],
//!   [`IncrementalSnapshotChangeRecordReceiver`])
//! - [`TransactionMonitor`] - Per-partition transaction tracking
//! - [`HistorizedSchema`] - Versioned schema store
//! - [`Heartbeat`] - Offset keep-alive records
//! - [`SignalProcessor`] - Control signals from the signal collection
//! - [`ChunkWindow`] - Incremental snapshot deduplication
//! - [`CdcSource`] - Source lifecycle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Common Module                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ChangeRecordEmitter ──► EventDispatcher                    │
//! │                            ├─ DataCollectionFilter          │
//! │                            ├─ DatabaseSchema                │
//! │                            ├─ SignalProcessor               │
//! │                            ├─ TransactionMonitor            │
//! │                            ├─ DataChangeEventListener       │
//! │                            ├─ IncrementalSnapshot source    │
//! │                            └─ Receiver ──► ChangeEventQueue │
//! │                                                  │          │
//! │                                   Heartbeat ─────┘          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod dispatcher;
mod emitter;
mod error;
mod event;
mod filter;
mod heartbeat;
pub mod incremental_snapshot;
mod listener;
mod offset;
mod queue;
mod receiver;
mod schema;
pub mod schema_change;
mod signal;
mod task;
mod topic;
mod traits;
mod transaction;

pub use config::*;
pub use dispatcher::*;
pub use emitter::*;
pub use error::*;
pub use event::*;
pub use filter::*;
pub use heartbeat::*;
pub use incremental_snapshot::{
    ChunkRow, ChunkWindow, ChunkWindowStats, IncrementalSnapshotChangeEventSource,
    NoIncrementalSnapshot,
};
pub use listener::*;
pub use offset::*;
pub use queue::*;
pub use receiver::*;
pub use schema::*;
pub use schema_change::{
    SchemaChangeEvent, SchemaChangeEventEmitter, SchemaChangeType, TableChange,
};
pub use signal::*;
pub use task::*;
pub use topic::*;
pub use traits::*;
pub use transaction::*;
