//! # CDC Signaling
//!
//! Control channel fed by rows of the signal collection.
//!
//! ## Debezium Compatibility
//!
//! Signal rows follow the Debezium signaling table format:
//! ```sql
//! CREATE TABLE debezium_signal (
//!     id VARCHAR(42) PRIMARY KEY,
//!     type VARCHAR(32) NOT NULL,
//!     data VARCHAR(2048) NULL
//! );
//! ```
//!
//! ## Flow
//!
//! The dispatcher hands each intercepted signal row to
//! [`SourceSignalChannel::process`], then calls
//! [`SignalProcessor::process_source_signal`] before the row itself is
//! dispatched. Every state change a signal triggers therefore lands before the
//! row's position can be committed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let processor = SignalProcessor::new();
//!
//! processor.register_handler("execute-snapshot", |signal| {
//!     let tables = signal.data.data_collections.clone();
//!     async move {
//!         start_incremental_snapshot(tables);
//!         SignalResult::Success
//!     }
//! });
//! ```

use crate::common::{CdcError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Signal action types, compatible with Debezium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalAction {
    /// Execute an incremental snapshot for the listed collections
    ExecuteSnapshot,
    /// Stop an in-progress incremental snapshot
    StopSnapshot,
    /// Pause the incremental snapshot
    PauseSnapshot,
    /// Resume the incremental snapshot
    ResumeSnapshot,
    /// Log a message
    Log,
    /// Incremental snapshot window open marker
    SnapshotWindowOpen,
    /// Incremental snapshot window close marker
    SnapshotWindowClose,
    /// Custom action
    Custom(String),
}

impl SignalAction {
    pub fn as_str(&self) -> &str {
        match self {
            SignalAction::ExecuteSnapshot => "execute-snapshot",
            SignalAction::StopSnapshot => "stop-snapshot",
            SignalAction::PauseSnapshot => "pause-snapshot",
            SignalAction::ResumeSnapshot => "resume-snapshot",
            SignalAction::Log => "log",
            SignalAction::SnapshotWindowOpen => "snapshot-window-open",
            SignalAction::SnapshotWindowClose => "snapshot-window-close",
            SignalAction::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "execute-snapshot" => SignalAction::ExecuteSnapshot,
            "stop-snapshot" => SignalAction::StopSnapshot,
            "pause-snapshot" => SignalAction::PauseSnapshot,
            "resume-snapshot" => SignalAction::ResumeSnapshot,
            "log" => SignalAction::Log,
            "snapshot-window-open" => SignalAction::SnapshotWindowOpen,
            "snapshot-window-close" => SignalAction::SnapshotWindowClose,
            other => SignalAction::Custom(other.to_string()),
        }
    }

    /// Watermark markers written by the incremental snapshot itself.
    pub fn is_watermark(&self) -> bool {
        matches!(
            self,
            SignalAction::SnapshotWindowOpen | SignalAction::SnapshotWindowClose
        )
    }
}

/// Signal data payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    /// Collections to snapshot
    #[serde(default, rename = "data-collections")]
    pub data_collections: Vec<String>,
    /// Snapshot type (incremental, blocking)
    #[serde(default, rename = "type")]
    pub snapshot_type: Option<String>,
    #[serde(default, flatten)]
    pub properties: HashMap<String, Value>,
}

impl SignalData {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_snapshot(tables: Vec<String>, snapshot_type: &str) -> Self {
        Self {
            data_collections: tables,
            snapshot_type: Some(snapshot_type.to_string()),
            properties: HashMap::new(),
        }
    }

    pub fn for_log(message: &str) -> Self {
        Self::empty().with_property("message", Value::String(message.to_string()))
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn log_message(&self) -> Option<&str> {
        self.properties.get("message")?.as_str()
    }

    /// Decode the `data` column, which may hold a JSON string, an object, or null.
    fn from_column(column: Option<&Value>) -> Result<Self> {
        match column {
            None | Some(Value::Null) => Ok(Self::empty()),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(Self::empty()),
            Some(Value::String(s)) => serde_json::from_str(s)
                .map_err(|e| CdcError::signal(format!("Invalid signal data: {}", e))),
            Some(other) => serde_json::from_value(other.clone())
                .map_err(|e| CdcError::signal(format!("Invalid signal data: {}", e))),
        }
    }
}

/// A signal, in Debezium's format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    #[serde(rename = "type")]
    pub action: SignalAction,
    #[serde(default)]
    pub data: SignalData,
    /// Milliseconds since epoch
    pub timestamp: i64,
}

impl Signal {
    pub fn new(id: impl Into<String>, action: SignalAction, data: SignalData) -> Self {
        Self {
            id: id.into(),
            action,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Incremental snapshot request for the given collections.
    pub fn execute_snapshot(tables: Vec<String>) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            SignalAction::ExecuteSnapshot,
            SignalData::for_snapshot(tables, "incremental"),
        )
    }

    pub fn log(message: &str) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            SignalAction::Log,
            SignalData::for_log(message),
        )
    }

    /// Decode a signal from a change event value.
    ///
    /// Uses the `after` image, falling back to `before` for deletes.
    pub fn from_record_value(value: &Value) -> Result<Self> {
        let row = value
            .get("after")
            .filter(|v| !v.is_null())
            .or_else(|| value.get("before").filter(|v| !v.is_null()))
            .ok_or_else(|| CdcError::signal("Signal record has no row image"))?;

        let id = row
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CdcError::signal("Signal record has no id"))?;
        let action = row
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CdcError::signal(format!("Signal '{}' has no type", id)))?;
        let data = SignalData::from_column(row.get("data"))?;

        Ok(Self::new(id, SignalAction::parse(action), data))
    }
}

/// Outcome of one signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalResult {
    Success,
    /// Accepted; the work finishes later
    Pending(String),
    /// Nothing to do for this action
    Ignored(String),
    Failed(String),
}

impl SignalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SignalResult::Success | SignalResult::Pending(_))
    }
}

/// Counters per signal outcome.
#[derive(Debug, Default)]
pub struct SignalStats {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    ignored: AtomicU64,
}

impl SignalStats {
    fn record(&self, result: &SignalResult) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            SignalResult::Success | SignalResult::Pending(_) => &self.processed,
            SignalResult::Failed(_) => &self.failed,
            SignalResult::Ignored(_) => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }
}

/// Signals decoded from the signal collection, waiting to be processed.
#[derive(Debug, Default)]
pub struct SourceSignalChannel {
    pending: Mutex<VecDeque<Signal>>,
}

impl SourceSignalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and queue a signal record value.
    pub fn process(&self, value: &Value) -> Result<()> {
        let signal = Signal::from_record_value(value)?;
        debug!(id = %signal.id, action = %signal.action.as_str(), "Received source signal");
        self.pending.lock().push_back(signal);
        Ok(())
    }

    /// Take every queued signal, oldest first.
    pub fn drain(&self) -> Vec<Signal> {
        self.pending.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

type SignalFuture = Pin<Box<dyn Future<Output = SignalResult> + Send>>;
type SignalHandler = Arc<dyn Fn(&Signal) -> SignalFuture + Send + Sync>;

/// Runs queued signals against the registered action handlers.
///
/// Pause and resume are handled here; every other action needs a handler,
/// usually installed by the incremental snapshot sub-process.
pub struct SignalProcessor {
    handlers: RwLock<HashMap<String, SignalHandler>>,
    source_channel: Arc<SourceSignalChannel>,
    stats: Arc<SignalStats>,
    paused: AtomicBool,
}

impl std::fmt::Debug for SignalProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalProcessor")
            .field("actions", &self.handlers.read().len())
            .field("pending", &self.source_channel.len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Default for SignalProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalProcessor {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            source_channel: Arc::new(SourceSignalChannel::new()),
            stats: Arc::new(SignalStats::default()),
            paused: AtomicBool::new(false),
        }
    }

    /// Channel fed by intercepted signal records.
    pub fn source_channel(&self) -> &Arc<SourceSignalChannel> {
        &self.source_channel
    }

    pub fn stats(&self) -> &Arc<SignalStats> {
        &self.stats
    }

    /// Whether a pause-snapshot signal is in effect.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Install the handler of `action`, replacing any previous one.
    pub fn register_handler<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(&Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SignalResult> + Send + 'static,
    {
        let handler: SignalHandler = Arc::new(move |signal| Box::pin(handler(signal)));
        if self.handlers.write().insert(action.to_string(), handler).is_some() {
            debug!(action, "Replaced signal handler");
        }
    }

    /// Process every signal queued on the source channel.
    ///
    /// Completes only after all handlers have run.
    pub async fn process_source_signal(&self) -> Vec<SignalResult> {
        let mut results = Vec::new();
        for signal in self.source_channel.drain() {
            results.push(self.process(signal).await);
        }
        results
    }

    pub async fn process(&self, signal: Signal) -> SignalResult {
        let result = match &signal.action {
            SignalAction::PauseSnapshot | SignalAction::ResumeSnapshot => {
                let pause = signal.action == SignalAction::PauseSnapshot;
                self.paused.store(pause, Ordering::Release);
                info!(id = %signal.id, paused = pause, "Incremental snapshot state changed by signal");
                SignalResult::Success
            }
            SignalAction::Log => {
                info!(id = %signal.id, message = signal.data.log_message().unwrap_or_default(), "Signal log message");
                SignalResult::Success
            }
            action => {
                let handler = self.handlers.read().get(action.as_str()).cloned();
                match handler {
                    Some(handler) => handler(&signal).await,
                    None if action.is_watermark() => SignalResult::Ignored("watermark".to_string()),
                    None => {
                        warn!(id = %signal.id, action = %action.as_str(), "Signal action has no handler");
                        SignalResult::Ignored(format!("no handler for '{}'", action.as_str()))
                    }
                }
            }
        };

        if let SignalResult::Failed(msg) = &result {
            warn!(id = %signal.id, error = %msg, "Signal failed");
        }
        self.stats.record(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_signal_action_parse() {
        assert_eq!(
            SignalAction::parse("execute-snapshot"),
            SignalAction::ExecuteSnapshot
        );
        assert_eq!(
            SignalAction::parse("snapshot-window-open"),
            SignalAction::SnapshotWindowOpen
        );
        assert_eq!(
            SignalAction::parse("reindex"),
            SignalAction::Custom("reindex".to_string())
        );
        assert_eq!(SignalAction::Custom("x".into()).as_str(), "x");
    }

    #[test]
    fn test_decode_from_after_image() {
        let value = json!({
            "before": null,
            "after": {
                "id": "sig-1",
                "type": "execute-snapshot",
                "data": "{\"data-collections\": [\"testdb.dbo.orders\"], \"type\": \"incremental\"}"
            },
            "op": "c"
        });

        let signal = Signal::from_record_value(&value).unwrap();
        assert_eq!(signal.id, "sig-1");
        assert_eq!(signal.action, SignalAction::ExecuteSnapshot);
        assert_eq!(signal.data.data_collections, vec!["testdb.dbo.orders"]);
        assert_eq!(signal.data.snapshot_type.as_deref(), Some("incremental"));
    }

    #[test]
    fn test_decode_from_before_image() {
        let value = json!({
            "before": {"id": "w-1", "type": "snapshot-window-open", "data": null},
            "after": null,
            "op": "d"
        });
        let signal = Signal::from_record_value(&value).unwrap();
        assert_eq!(signal.action, SignalAction::SnapshotWindowOpen);
        assert_eq!(signal.data, SignalData::empty());
    }

    #[test]
    fn test_decode_rejects_malformed_rows() {
        assert!(Signal::from_record_value(&json!({"op": "c"})).is_err());
        assert!(Signal::from_record_value(&json!({"after": {"type": "log"}})).is_err());
        assert!(Signal::from_record_value(&json!({
            "after": {"id": "x", "type": "log", "data": "{not json"}
        }))
        .is_err());
    }

    #[tokio::test]
    async fn test_source_signals_processed_in_order() {
        let processor = SignalProcessor::new();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            processor
                .register_handler("execute-snapshot", move |_signal| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        SignalResult::Success
                    }
                });
        }

        let channel = processor.source_channel();
        channel
            .process(&json!({"after": {"id": "1", "type": "pause-snapshot"}}))
            .unwrap();
        channel
            .process(&json!({"after": {"id": "2", "type": "execute-snapshot"}}))
            .unwrap();
        assert_eq!(channel.len(), 2);

        let results = processor.process_source_signal().await;
        assert_eq!(results, vec![SignalResult::Success, SignalResult::Success]);
        assert!(processor.is_paused());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(channel.is_empty());
        assert_eq!(processor.stats().processed(), 2);
    }

    #[tokio::test]
    async fn test_unhandled_actions_are_ignored() {
        let processor = SignalProcessor::new();
        let result = processor
            .process(Signal::new("1", SignalAction::Custom("reindex".into()), SignalData::empty()))
            .await;
        assert!(matches!(result, SignalResult::Ignored(_)));

        let result = processor
            .process(Signal::new("2", SignalAction::SnapshotWindowClose, SignalData::empty()))
            .await;
        assert!(matches!(result, SignalResult::Ignored(_)));
        assert_eq!(processor.stats().ignored(), 2);
    }
}
