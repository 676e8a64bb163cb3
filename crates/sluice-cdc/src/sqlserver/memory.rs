//! In-process change log
//!
//! [`MemoryChangeLog`] keeps change tables, captured columns, change rows and
//! the transaction mapping per database. It evaluates [`ChangesQuery`] with
//! the same predicate and ordering the T-SQL text expresses, so everything
//! above the [`ChangeLog`] boundary behaves the same against it as against a
//! server.
//!
//! # Usage
//!
//! ```rust,ignore
//! let log = MemoryChangeLog::new();
//! log.create_change_table(entry, &["id", "name"]);
//! log.insert("testdb", "dbo_orders", row);
//! ```

use super::change_table::{CapturedColumn, ChangeRow, ChangeTable, ChangeTableEntry};
use super::error::SqlServerError;
use super::log::{ChangeLog, ChangeRowStream};
use super::lsn::Lsn;
use super::query::ChangesQuery;
use crate::common::{ColumnDefinition, DataCollectionSchema, Result, TableId};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

#[derive(Debug, Default)]
struct DatabaseLog {
    change_tables: Vec<ChangeTableEntry>,
    columns: Vec<CapturedColumn>,
    rows: HashMap<String, Vec<ChangeRow>>,
    /// Commit LSNs of real transactions
    transactions: BTreeSet<Lsn>,
    min_lsns: HashMap<String, Lsn>,
    schemas: HashMap<TableId, DataCollectionSchema>,
    dropped: HashSet<String>,
    agent_stopped: bool,
}

impl DatabaseLog {
    fn max_lsn(&self) -> Lsn {
        let max_tx = self.transactions.iter().next_back().copied();
        let max_start = self.change_tables.iter().map(|t| t.start_lsn).max();
        max_tx.max(max_start).unwrap_or(Lsn::NULL)
    }
}

/// Change log held in memory.
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    databases: RwLock<HashMap<String, DatabaseLog>>,
    failing_reads: AtomicUsize,
    fetches: AtomicU64,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capture instance and its captured columns (by ordinal).
    pub fn create_change_table(&self, entry: ChangeTableEntry, columns: &[&str]) {
        let mut dbs = self.databases.write();
        let db = dbs.entry(entry.database.clone()).or_default();
        for (i, name) in columns.iter().enumerate() {
            db.columns.push(CapturedColumn {
                object_id: entry.object_id,
                column_name: name.to_string(),
                column_id: i as i32 + 1,
            });
        }
        db.dropped.remove(&entry.capture_instance);
        db.change_tables.push(entry);
    }

    /// Register the structure returned by [`ChangeLog::table_schema`].
    pub fn register_schema(&self, schema: DataCollectionSchema) {
        let mut dbs = self.databases.write();
        dbs.entry(schema.id.catalog.clone())
            .or_default()
            .schemas
            .insert(schema.id.clone(), schema);
    }

    /// Append a change row and record its transaction.
    pub fn insert(&self, database: &str, capture_instance: &str, row: ChangeRow) {
        let mut dbs = self.databases.write();
        let db = dbs.entry(database.to_string()).or_default();
        db.transactions.insert(row.commit_lsn);
        db.rows
            .entry(capture_instance.to_string())
            .or_default()
            .push(row);
    }

    /// Record a transaction that touched no captured table.
    pub fn record_transaction(&self, database: &str, commit_lsn: Lsn) {
        self.databases
            .write()
            .entry(database.to_string())
            .or_default()
            .transactions
            .insert(commit_lsn);
    }

    /// Drop a capture instance; later reads fail with `ChangeTableGone`.
    pub fn drop_change_table(&self, database: &str, capture_instance: &str) {
        let mut dbs = self.databases.write();
        if let Some(db) = dbs.get_mut(database) {
            let object_ids: Vec<i32> = db
                .change_tables
                .iter()
                .filter(|t| t.capture_instance == capture_instance)
                .map(|t| t.object_id)
                .collect();
            db.change_tables
                .retain(|t| t.capture_instance != capture_instance);
            db.columns.retain(|c| !object_ids.contains(&c.object_id));
            db.rows.remove(capture_instance);
            db.dropped.insert(capture_instance.to_string());
        }
    }

    /// Simulate cleanup: drop rows before `lsn` and raise the minimum.
    pub fn truncate_before(&self, database: &str, capture_instance: &str, lsn: Lsn) {
        let mut dbs = self.databases.write();
        if let Some(db) = dbs.get_mut(database) {
            if let Some(rows) = db.rows.get_mut(capture_instance) {
                rows.retain(|r| r.commit_lsn >= lsn);
            }
            db.min_lsns.insert(capture_instance.to_string(), lsn);
        }
    }

    pub fn set_agent_running(&self, database: &str, running: bool) {
        self.databases
            .write()
            .entry(database.to_string())
            .or_default()
            .agent_stopped = !running;
    }

    /// Make the next `n` row fetches fail with a read failure.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Number of row fetches issued so far.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn with_db<T>(&self, database: &str, f: impl FnOnce(&DatabaseLog) -> T) -> Option<T> {
        self.databases.read().get(database).map(f)
    }

    fn transaction_lsns(&self, database: &str) -> Vec<Lsn> {
        self.with_db(database, |db| db.transactions.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    async fn max_lsn(&self, database: &str) -> Result<Lsn> {
        Ok(self.with_db(database, DatabaseLog::max_lsn).unwrap_or(Lsn::NULL))
    }

    async fn min_lsn(&self, database: &str, capture_instance: &str) -> Result<Lsn> {
        Ok(self
            .with_db(database, |db| {
                db.min_lsns.get(capture_instance).copied().or_else(|| {
                    db.change_tables
                        .iter()
                        .find(|t| t.capture_instance == capture_instance)
                        .map(|t| t.start_lsn)
                })
            })
            .flatten()
            .unwrap_or(Lsn::NULL))
    }

    async fn increment_lsn(&self, _database: &str, lsn: &Lsn) -> Result<Lsn> {
        Ok(lsn.increment())
    }

    async fn max_transaction_lsn(&self, database: &str) -> Result<Lsn> {
        Ok(self
            .transaction_lsns(database)
            .last()
            .copied()
            .unwrap_or(Lsn::NULL))
    }

    async fn nth_transaction_lsn_from_beginning(&self, database: &str, n: u32) -> Result<Lsn> {
        Ok(self
            .transaction_lsns(database)
            .into_iter()
            .take(n as usize)
            .max()
            .unwrap_or(Lsn::NULL))
    }

    async fn nth_transaction_lsn_from_last(
        &self,
        database: &str,
        last: &Lsn,
        n: u32,
    ) -> Result<Lsn> {
        Ok(self
            .transaction_lsns(database)
            .into_iter()
            .filter(|lsn| lsn >= last)
            .take(n as usize + 1)
            .max()
            .unwrap_or(Lsn::NULL))
    }

    async fn min_change_table_lsn(&self, database: &str) -> Result<Lsn> {
        Ok(self
            .with_db(database, |db| db.change_tables.iter().map(|t| t.start_lsn).min())
            .flatten()
            .unwrap_or(Lsn::NULL))
    }

    async fn change_table_entries(&self, database: &str) -> Result<Vec<ChangeTableEntry>> {
        Ok(self
            .with_db(database, |db| db.change_tables.clone())
            .unwrap_or_default())
    }

    async fn captured_columns(&self, database: &str) -> Result<Vec<CapturedColumn>> {
        Ok(self
            .with_db(database, |db| db.columns.clone())
            .unwrap_or_default())
    }

    async fn table_schema(&self, table: &ChangeTable) -> Result<DataCollectionSchema> {
        let registered = self
            .with_db(&table.source_table.catalog, |db| {
                db.schemas.get(&table.source_table).cloned()
            })
            .flatten();
        Ok(registered.unwrap_or_else(|| {
            let columns = table
                .captured_columns
                .iter()
                .enumerate()
                .map(|(i, name)| ColumnDefinition::new(name.clone(), "sql_variant", i as u32 + 1))
                .collect();
            DataCollectionSchema::new(table.source_table.clone(), columns, Vec::new())
        }))
    }

    async fn is_agent_running(&self, database: &str) -> Result<bool> {
        Ok(self
            .with_db(database, |db| !db.agent_stopped)
            .unwrap_or(true))
    }

    async fn fetch_changes(
        &self,
        table: &ChangeTable,
        query: &ChangesQuery,
    ) -> Result<ChangeRowStream> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SqlServerError::QueryFailed(format!(
                "injected failure reading {}",
                table.change_table_name()
            ))
            .into());
        }

        let database = &table.source_table.catalog;
        let rows = {
            let dbs = self.databases.read();
            let db = dbs.get(database.as_str());
            let gone = db.map_or(true, |db| {
                db.dropped.contains(&table.capture_instance)
                    || !db
                        .change_tables
                        .iter()
                        .any(|t| t.capture_instance == table.capture_instance)
            });
            if gone {
                return Err(SqlServerError::ChangeTableGone(table.capture_instance.clone()).into());
            }
            let mut rows: Vec<ChangeRow> = db
                .and_then(|db| db.rows.get(&table.capture_instance))
                .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
                .unwrap_or_default();
            rows.sort_by(|a, b| query.compare(a, b));
            if query.max_rows > 0 {
                rows.truncate(query.max_rows as usize);
            }
            rows
        };

        trace!(
            table = %table.change_table_name(),
            rows = rows.len(),
            "Fetched change rows"
        );
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }
}
