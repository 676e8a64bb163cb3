//! Source task context
//!
//! Identity of a running connector task. Supplies the extended record
//! headers and the fields of the dispatcher's tracing span.

use crate::common::event::Headers;
use crate::common::schema::TableId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a source task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Initial,
    Running,
    Restarting,
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Initial => "initial",
            TaskState::Running => "running",
            TaskState::Restarting => "restarting",
            TaskState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

type CollectionsSupplier = Arc<dyn Fn() -> Vec<TableId> + Send + Sync>;

/// Identity and shared state of one connector task.
#[derive(Clone)]
pub struct CdcSourceTaskContext {
    connector_type: String,
    logical_name: String,
    connector_name: String,
    task_id: String,
    custom_metric_tags: BTreeMap<String, String>,
    collections: CollectionsSupplier,
    state: Arc<RwLock<TaskState>>,
}

impl fmt::Debug for CdcSourceTaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdcSourceTaskContext")
            .field("connector_type", &self.connector_type)
            .field("logical_name", &self.logical_name)
            .field("connector_name", &self.connector_name)
            .field("task_id", &self.task_id)
            .field("state", &self.state())
            .finish()
    }
}

impl CdcSourceTaskContext {
    pub fn new(
        connector_type: impl Into<String>,
        logical_name: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        let logical_name = logical_name.into();
        Self {
            connector_type: connector_type.into(),
            connector_name: logical_name.clone(),
            logical_name,
            task_id: task_id.into(),
            custom_metric_tags: BTreeMap::new(),
            collections: Arc::new(Vec::new),
            state: Arc::new(RwLock::new(TaskState::Initial)),
        }
    }

    /// Name of the deployed connector (plugin instance).
    pub fn with_connector_name(mut self, name: impl Into<String>) -> Self {
        self.connector_name = name.into();
        self
    }

    pub fn with_metric_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_metric_tags.insert(key.into(), value.into());
        self
    }

    /// Source of the currently captured collections.
    pub fn with_collections<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> Vec<TableId> + Send + Sync + 'static,
    {
        self.collections = Arc::new(supplier);
        self
    }

    pub fn connector_type(&self) -> &str {
        &self.connector_type
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn connector_name(&self) -> &str {
        &self.connector_name
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn custom_metric_tags(&self) -> &BTreeMap<String, String> {
        &self.custom_metric_tags
    }

    pub fn captured_collections(&self) -> Vec<TableId> {
        (self.collections)()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TaskState) {
        *self.state.write() = state;
    }

    /// Headers added to every data record when extended headers are enabled.
    pub fn extended_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers
            .add("context.connectorLogicalName", self.logical_name.clone())
            .add("context.taskId", self.task_id.clone())
            .add("context.connectorName", self.connector_name.clone());
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extended_headers() {
        let ctx = CdcSourceTaskContext::new("sqlserver", "srv1", "0").with_connector_name("inventory");
        let headers = ctx.extended_headers();

        assert_eq!(headers.len(), 3);
        assert_eq!(
            headers.last_with_name("context.connectorLogicalName"),
            Some(&json!("srv1"))
        );
        assert_eq!(headers.last_with_name("context.connectorName"), Some(&json!("inventory")));
    }

    #[test]
    fn test_state_shared_between_clones() {
        let ctx = CdcSourceTaskContext::new("sqlserver", "srv1", "0")
            .with_collections(|| vec![TableId::new("testdb", "dbo", "orders")]);
        let clone = ctx.clone();
        clone.set_state(TaskState::Running);

        assert_eq!(ctx.state(), TaskState::Running);
        assert_eq!(ctx.captured_collections().len(), 1);
        assert_eq!(TaskState::Restarting.to_string(), "restarting");
    }
}
