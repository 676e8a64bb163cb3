//! # Heartbeats
//!
//! Periodic records carrying the current offset so the durable position keeps
//! advancing through long stretches without matching data changes.
//!
//! ## Features
//!
//! - Interval-based scheduling (0 disables heartbeats)
//! - Forced emission for explicit checkpoints
//! - Records keyed by server name on `<heartbeat prefix>.<topic prefix>`
//!
//! ## Usage
//!
//! ```rust,ignore
//! let heartbeat = Heartbeat::new(&config, &topics);
//!
//! // Emits only when the interval has elapsed since the last heartbeat
//! heartbeat.heartbeat(&partition, offset.offset(), &queue).await?;
//! ```

use crate::common::config::ConnectorConfig;
use crate::common::event::{Headers, OutputRecord, RecordSchema, SchemaRef};
use crate::common::offset::{OffsetMap, SourcePartition};
use crate::common::queue::ChangeEventQueue;
use crate::common::topic::TopicNamingStrategy;
use crate::common::Result;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Heartbeat statistics.
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    heartbeats_sent: AtomicU64,
    last_heartbeat_ts: AtomicI64,
}

impl HeartbeatStats {
    pub fn record_heartbeat(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        self.last_heartbeat_ts
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub fn last_heartbeat_ts(&self) -> i64 {
        self.last_heartbeat_ts.load(Ordering::Relaxed)
    }
}

/// Interval-scheduled heartbeat emitter.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    topic: String,
    server_name: String,
    key_schema: SchemaRef,
    value_schema: SchemaRef,
    next_due: Mutex<Instant>,
    stats: Arc<HeartbeatStats>,
}

impl Heartbeat {
    pub fn new(config: &ConnectorConfig, topics: &TopicNamingStrategy) -> Self {
        let interval = config.heartbeat_interval();
        Self {
            interval,
            topic: topics.heartbeat_topic(),
            server_name: config.topic_prefix.clone(),
            key_schema: Arc::new(RecordSchema::new(
                "io.debezium.connector.common.ServerNameKey",
                vec!["serverName".to_string()],
            )),
            value_schema: Arc::new(RecordSchema::new(
                "io.debezium.connector.common.Heartbeat",
                vec!["ts_ms".to_string()],
            )),
            next_due: Mutex::new(Instant::now() + interval),
            stats: Arc::new(HeartbeatStats::default()),
        }
    }

    /// Whether heartbeats are configured at all.
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> &Arc<HeartbeatStats> {
        &self.stats
    }

    /// Emit a heartbeat if the interval has elapsed.
    ///
    /// Returns whether a heartbeat record was enqueued.
    pub async fn heartbeat(
        &self,
        partition: &SourcePartition,
        offset: OffsetMap,
        queue: &ChangeEventQueue,
    ) -> Result<bool> {
        if !self.is_enabled() || !self.claim_due() {
            return Ok(false);
        }
        self.emit(partition, offset, queue).await?;
        Ok(true)
    }

    /// Emit a heartbeat regardless of the schedule.
    pub async fn force_heartbeat(
        &self,
        partition: &SourcePartition,
        offset: OffsetMap,
        queue: &ChangeEventQueue,
    ) -> Result<()> {
        *self.next_due.lock() = Instant::now() + self.interval;
        self.emit(partition, offset, queue).await
    }

    /// Check the schedule and reset it when due.
    fn claim_due(&self) -> bool {
        let now = Instant::now();
        let mut next_due = self.next_due.lock();
        if now < *next_due {
            return false;
        }
        *next_due = now + self.interval;
        true
    }

    async fn emit(
        &self,
        partition: &SourcePartition,
        offset: OffsetMap,
        queue: &ChangeEventQueue,
    ) -> Result<()> {
        let ts_ms = chrono::Utc::now().timestamp_millis();
        debug!(topic = %self.topic, "Emitting heartbeat");

        let record = OutputRecord {
            source_partition: partition.clone(),
            source_offset: offset,
            topic: self.topic.clone(),
            kafka_partition: None,
            key_schema: Some(self.key_schema.clone()),
            key: Some(json!({ "serverName": self.server_name })),
            value_schema: Some(self.value_schema.clone()),
            value: Some(json!({ "ts_ms": ts_ms })),
            timestamp: Some(ts_ms),
            headers: Headers::new(),
        };

        queue.enqueue(record).await?;
        self.stats.record_heartbeat();
        Ok(())
    }
}
