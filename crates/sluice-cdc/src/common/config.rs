//! Connector configuration shared by the dispatch pipeline
//!
//! # Example
//!
//! ```rust
//! use sluice_cdc::common::{ConnectorConfig, EventProcessingFailureHandlingMode};
//!
//! let config = ConnectorConfig::builder()
//!     .topic_prefix("inventory")
//!     .heartbeat_interval_ms(10_000)
//!     .failure_handling_mode(EventProcessingFailureHandlingMode::Warn)
//!     .build()
//!     .unwrap();
//!
//! assert!(config.emit_tombstones_on_delete);
//! ```

use crate::common::event::Operation;
use crate::common::schema::TableId;
use crate::common::{CdcError, DataCollectionFilter, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// What to do when processing a single event fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventProcessingFailureHandlingMode {
    /// Abort the task
    #[default]
    Fail,
    /// Log a warning and continue
    Warn,
    /// Continue silently
    Skip,
}

/// How incremental snapshot windows are marked in the signal collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkStrategy {
    /// Insert open marker, insert close marker
    #[default]
    InsertInsert,
    /// Insert open marker, delete it on close
    InsertDelete,
}

/// Pipeline-wide connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Logical name, used as topic prefix and server name
    pub topic_prefix: String,
    /// Emit a tombstone after every streamed delete
    pub emit_tombstones_on_delete: bool,
    /// Operations dropped by the dispatcher
    pub skipped_operations: Vec<Operation>,
    /// Whether the source applies the skip set upstream
    pub supports_operation_filtering: bool,
    pub event_processing_failure_handling_mode: EventProcessingFailureHandlingMode,
    /// Heartbeat interval in milliseconds (0 disables heartbeats)
    pub heartbeat_interval_ms: u64,
    pub heartbeat_topics_prefix: String,
    /// Publish schema changes to the schema change topic
    pub include_schema_changes: bool,
    /// Publish BEGIN/END transaction records and enrich events
    pub provide_transaction_metadata: bool,
    /// `catalog.schema.table` of the signal collection
    pub signal_data_collection: Option<String>,
    pub incremental_snapshot_watermarking_strategy: WatermarkStrategy,
    /// Parallel snapshot workers
    pub snapshot_max_threads: usize,
    /// Outbound queue capacity
    pub max_queue_size: usize,
    /// Add task context headers to every record
    pub extended_headers_enabled: bool,
    /// Tables to include (glob patterns; empty = all)
    pub include_tables: Vec<String>,
    /// Tables to exclude
    pub exclude_tables: Vec<String>,
    /// Keep schema history only for captured tables
    pub store_only_captured_tables_ddl: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            topic_prefix: String::new(),
            emit_tombstones_on_delete: true,
            skipped_operations: vec![Operation::Truncate],
            supports_operation_filtering: false,
            event_processing_failure_handling_mode: EventProcessingFailureHandlingMode::Fail,
            heartbeat_interval_ms: 0,
            heartbeat_topics_prefix: "__debezium-heartbeat".to_string(),
            include_schema_changes: true,
            provide_transaction_metadata: false,
            signal_data_collection: None,
            incremental_snapshot_watermarking_strategy: WatermarkStrategy::InsertInsert,
            snapshot_max_threads: 1,
            max_queue_size: 8192,
            extended_headers_enabled: true,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            store_only_captured_tables_ddl: false,
        }
    }
}

impl ConnectorConfig {
    /// Create a new builder for ConnectorConfig
    pub fn builder() -> ConnectorConfigBuilder {
        ConnectorConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.topic_prefix.trim().is_empty() {
            return Err(CdcError::config("Topic prefix is required"));
        }
        if self.max_queue_size == 0 {
            return Err(CdcError::config("Max queue size must be > 0"));
        }
        if self.snapshot_max_threads == 0 {
            return Err(CdcError::config("Snapshot max threads must be > 0"));
        }
        if let Some(signal) = &self.signal_data_collection {
            signal.parse::<TableId>()?;
        }
        DataCollectionFilter::new(&self.include_tables, &self.exclude_tables)?;
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn skipped_operation_set(&self) -> HashSet<Operation> {
        self.skipped_operations.iter().copied().collect()
    }

    /// Compile the table filter.
    pub fn table_filter(&self) -> Result<DataCollectionFilter> {
        DataCollectionFilter::new(&self.include_tables, &self.exclude_tables)
    }

    /// Check if a collection is the configured signal collection.
    pub fn is_signal_data_collection(&self, id: &TableId) -> bool {
        self.signal_data_collection
            .as_deref()
            .and_then(|s| s.parse::<TableId>().ok())
            .map(|signal| signal_matches(&signal, id))
            .unwrap_or(false)
    }
}

fn signal_matches(signal: &TableId, id: &TableId) -> bool {
    signal.catalog.eq_ignore_ascii_case(&id.catalog)
        && signal.schema.eq_ignore_ascii_case(&id.schema)
        && signal.table.eq_ignore_ascii_case(&id.table)
}

/// Builder for ConnectorConfig
#[derive(Default)]
pub struct ConnectorConfigBuilder {
    config: ConnectorConfig,
}

impl ConnectorConfigBuilder {
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.topic_prefix = prefix.into();
        self
    }

    pub fn emit_tombstones_on_delete(mut self, enabled: bool) -> Self {
        self.config.emit_tombstones_on_delete = enabled;
        self
    }

    pub fn skipped_operations(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.config.skipped_operations = ops.into_iter().collect();
        self
    }

    pub fn supports_operation_filtering(mut self, supported: bool) -> Self {
        self.config.supports_operation_filtering = supported;
        self
    }

    pub fn failure_handling_mode(mut self, mode: EventProcessingFailureHandlingMode) -> Self {
        self.config.event_processing_failure_handling_mode = mode;
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    pub fn heartbeat_topics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.heartbeat_topics_prefix = prefix.into();
        self
    }

    pub fn include_schema_changes(mut self, enabled: bool) -> Self {
        self.config.include_schema_changes = enabled;
        self
    }

    pub fn provide_transaction_metadata(mut self, enabled: bool) -> Self {
        self.config.provide_transaction_metadata = enabled;
        self
    }

    pub fn signal_data_collection(mut self, collection: impl Into<String>) -> Self {
        self.config.signal_data_collection = Some(collection.into());
        self
    }

    pub fn watermarking_strategy(mut self, strategy: WatermarkStrategy) -> Self {
        self.config.incremental_snapshot_watermarking_strategy = strategy;
        self
    }

    pub fn snapshot_max_threads(mut self, threads: usize) -> Self {
        self.config.snapshot_max_threads = threads;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    pub fn extended_headers_enabled(mut self, enabled: bool) -> Self {
        self.config.extended_headers_enabled = enabled;
        self
    }

    pub fn include_table(mut self, pattern: impl Into<String>) -> Self {
        self.config.include_tables.push(pattern.into());
        self
    }

    pub fn exclude_table(mut self, pattern: impl Into<String>) -> Self {
        self.config.exclude_tables.push(pattern.into());
        self
    }

    pub fn store_only_captured_tables_ddl(mut self, enabled: bool) -> Self {
        self.config.store_only_captured_tables_ddl = enabled;
        self
    }

    pub fn build(self) -> Result<ConnectorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
