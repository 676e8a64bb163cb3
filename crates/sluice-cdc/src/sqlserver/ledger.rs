//! # Position Ledger
//!
//! Owns the catalog of change tables for a database and answers every
//! "where in the log" question the streaming loop asks:
//!
//! - bound queries (`max_position`, `min_position`) that fail with
//!   `NotAvailable` when the retained log has no data
//! - `next_position` and `effective_start` for advancing and clamping reads
//! - change table discovery, with ties between capture instances of the same
//!   source table and start LSN resolved to the newest instance
//! - transaction windows for chunked catch-up
//!
//! ```text
//! cdc.change_tables ──┐
//!                     ├──► discover_change_tables ──► Vec<ChangeTable>
//! cdc.captured_columns┘        (ROW_NUMBER over source_object_id,
//!                               start_lsn by create_date DESC)
//! ```

use super::change_table::{CapturedColumn, ChangeTable, ChangeTableEntry};
use super::error::SqlServerError;
use super::log::ChangeLog;
use super::lsn::Lsn;
use super::offset::{SqlServerOffsetContext, SqlServerPartition};
use crate::common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Log position bookkeeping over a [`ChangeLog`].
#[derive(Clone)]
pub struct PositionLedger {
    log: Arc<dyn ChangeLog>,
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLedger").finish_non_exhaustive()
    }
}

impl PositionLedger {
    pub fn new(log: Arc<dyn ChangeLog>) -> Self {
        Self { log }
    }

    pub fn change_log(&self) -> &Arc<dyn ChangeLog> {
        &self.log
    }

    // ------------------------------------------------------------------------
    // Bounds
    // ------------------------------------------------------------------------

    /// Largest position in the database's change log.
    pub async fn max_position(&self, database: &str) -> Result<Lsn> {
        let lsn = self.log.max_lsn(database).await?;
        trace!(database, %lsn, "Current maximum lsn");
        available(lsn, "fn_cdc_get_max_lsn")
    }

    /// Smallest retained position of one capture instance.
    pub async fn min_position(&self, database: &str, capture_instance: &str) -> Result<Lsn> {
        let lsn = self.log.min_lsn(database, capture_instance).await?;
        trace!(database, capture_instance, %lsn, "Current minimum lsn");
        available(lsn, "fn_cdc_get_min_lsn")
    }

    /// Smallest position strictly greater than `lsn`.
    pub async fn next_position(&self, database: &str, lsn: &Lsn) -> Result<Lsn> {
        let next = self.log.increment_lsn(database, lsn).await?;
        trace!(from = %lsn, to = %next, "Increasing lsn");
        available(next, "fn_cdc_increment_lsn")
    }

    /// `max(table.start_lsn, requested)`, or the table minimum when that is NULL.
    ///
    /// Covers tables whose capture began inside the requested window.
    pub async fn effective_start(&self, table: &ChangeTable, requested: &Lsn) -> Result<Lsn> {
        let from = if table.start_lsn > *requested {
            table.start_lsn
        } else {
            *requested
        };
        if from.is_available() {
            return Ok(from);
        }
        self.min_position(&table.source_table.catalog, &table.capture_instance)
            .await
    }

    // ------------------------------------------------------------------------
    // Change tables
    // ------------------------------------------------------------------------

    /// Current capture instances, optionally restricted to `start_lsn <= as_of`.
    ///
    /// Among instances of one source table sharing a start LSN only the most
    /// recently created one is returned.
    pub async fn discover_change_tables(
        &self,
        database: &str,
        as_of: Option<&Lsn>,
    ) -> Result<Vec<ChangeTable>> {
        let as_of = as_of.filter(|lsn| lsn.is_available());
        let entries = self.log.change_table_entries(database).await?;

        let mut newest: HashMap<(i32, Lsn), ChangeTableEntry> = HashMap::new();
        for entry in entries {
            if let Some(limit) = as_of {
                if entry.start_lsn > *limit {
                    continue;
                }
            }
            let key = (entry.source_object_id, entry.start_lsn);
            match newest.get(&key) {
                Some(current) if current.create_date >= entry.create_date => {}
                _ => {
                    newest.insert(key, entry);
                }
            }
        }

        let columns = self.captured_columns(database).await?;
        let mut tables: Vec<ChangeTable> = newest
            .into_values()
            .map(|entry| to_change_table(entry, &columns))
            .collect();
        tables.sort_by(|a, b| {
            (&a.source_table, a.start_lsn, &a.capture_instance).cmp(&(
                &b.source_table,
                b.start_lsn,
                &b.capture_instance,
            ))
        });

        debug!(database, count = tables.len(), "Discovered change tables");
        Ok(tables)
    }

    /// Capture instances whose start LSN lies in `[from, to]`.
    pub async fn new_change_tables_between(
        &self,
        database: &str,
        from: &Lsn,
        to: &Lsn,
    ) -> Result<Vec<ChangeTable>> {
        let entries: Vec<ChangeTableEntry> = self
            .log
            .change_table_entries(database)
            .await?
            .into_iter()
            .filter(|e| e.start_lsn >= *from && e.start_lsn <= *to)
            .collect();
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let columns = self.captured_columns(database).await?;
        let mut tables: Vec<ChangeTable> = entries
            .into_iter()
            .map(|entry| to_change_table(entry, &columns))
            .collect();
        tables.sort_by(|a, b| a.start_lsn.cmp(&b.start_lsn));
        info!(
            database,
            %from,
            %to,
            tables = ?tables.iter().map(|t| t.capture_instance.as_str()).collect::<Vec<_>>(),
            "New change tables"
        );
        Ok(tables)
    }

    /// Captured column names per change table object id, by column ordinal.
    async fn captured_columns(&self, database: &str) -> Result<HashMap<i32, Vec<String>>> {
        let mut rows: Vec<CapturedColumn> = self.log.captured_columns(database).await?;
        rows.sort_by_key(|c| (c.object_id, c.column_id));
        let mut by_table: HashMap<i32, Vec<String>> = HashMap::new();
        for row in rows {
            by_table.entry(row.object_id).or_default().push(row.column_name);
        }
        Ok(by_table)
    }

    // ------------------------------------------------------------------------
    // Transaction windows
    // ------------------------------------------------------------------------

    /// Commit LSN of the most recent real transaction, NULL when there is none.
    pub async fn max_transaction_position(&self, database: &str) -> Result<Lsn> {
        let lsn = self.log.max_transaction_lsn(database).await?;
        trace!(database, %lsn, "Max transaction lsn");
        Ok(lsn)
    }

    /// Commit LSN of the Nth transaction of the retained log.
    pub async fn nth_transaction_from_beginning(&self, database: &str, n: u32) -> Result<Lsn> {
        let lsn = self
            .log
            .nth_transaction_lsn_from_beginning(database, n)
            .await?;
        trace!(database, n, %lsn, "Nth lsn from beginning");
        Ok(lsn)
    }

    /// Commit LSN at most `n` transactions after `last`.
    pub async fn nth_transaction_from_last(
        &self,
        database: &str,
        last: &Lsn,
        n: u32,
    ) -> Result<Lsn> {
        let lsn = self
            .log
            .nth_transaction_lsn_from_last(database, last, n)
            .await?;
        trace!(database, %last, n, %lsn, "Nth lsn from last");
        Ok(lsn)
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Whether streaming can resume from the stored offset.
    ///
    /// False when no change table exists. True when nothing is stored yet or
    /// the oldest change table starts before the stored commit LSN.
    pub async fn validate_log_position(
        &self,
        partition: &SqlServerPartition,
        offset: &SqlServerOffsetContext,
    ) -> Result<bool> {
        let stored = offset.position().commit_lsn;
        let oldest = self
            .log
            .min_change_table_lsn(partition.database_name())
            .await?;
        if !oldest.is_available() {
            return Ok(false);
        }

        info!(%oldest, %stored, "Validating stored log position");
        Ok(!stored.is_available() || oldest < stored)
    }

    pub async fn is_agent_running(&self, database: &str) -> Result<bool> {
        self.log.is_agent_running(database).await
    }
}

fn available(lsn: Lsn, source: &'static str) -> Result<Lsn> {
    if lsn.is_available() {
        Ok(lsn)
    } else {
        Err(SqlServerError::NullPosition(source).into())
    }
}

fn to_change_table(entry: ChangeTableEntry, columns: &HashMap<i32, Vec<String>>) -> ChangeTable {
    let captured = columns.get(&entry.object_id).cloned().unwrap_or_default();
    ChangeTable::new(
        entry.source_table_id(),
        entry.capture_instance,
        entry.object_id,
        entry.start_lsn,
        captured,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CdcError;
    use crate::sqlserver::memory::MemoryChangeLog;
    use chrono::{Duration, Utc};

    fn lsn(n: u32) -> Lsn {
        Lsn::from_parts(0, n, 0)
    }

    fn entry(capture: &str, object_id: i32, start: u32, age_secs: i64) -> ChangeTableEntry {
        ChangeTableEntry {
            database: "testdb".into(),
            source_schema: "dbo".into(),
            source_table: "orders".into(),
            capture_instance: capture.into(),
            object_id,
            source_object_id: 501,
            start_lsn: lsn(start),
            create_date: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn ledger(log: Arc<MemoryChangeLog>) -> PositionLedger {
        PositionLedger::new(log)
    }

    #[tokio::test]
    async fn test_tie_break_picks_newest_instance() {
        let log = Arc::new(MemoryChangeLog::new());
        log.create_change_table(entry("dbo_orders_v1", 1001, 100, 60), &["id"]);
        log.create_change_table(entry("dbo_orders_v2", 1002, 100, 10), &["id", "name"]);
        let ledger = ledger(log);

        let tables = ledger.discover_change_tables("testdb", None).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].capture_instance, "dbo_orders_v2");
        assert_eq!(tables[0].captured_columns, vec!["id", "name"]);
    }

    #[tokio::test]
    async fn test_discovery_as_of_position() {
        let log = Arc::new(MemoryChangeLog::new());
        log.create_change_table(entry("dbo_orders_v1", 1001, 100, 60), &["id"]);
        log.create_change_table(entry("dbo_orders_v2", 1002, 300, 10), &["id", "name"]);
        let ledger = ledger(log);

        let all = ledger.discover_change_tables("testdb", None).await.unwrap();
        assert_eq!(all.len(), 2);

        let early = ledger
            .discover_change_tables("testdb", Some(&lsn(200)))
            .await
            .unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].capture_instance, "dbo_orders_v1");

        let fresh = ledger
            .new_change_tables_between("testdb", &lsn(200), &lsn(300))
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].capture_instance, "dbo_orders_v2");
    }

    #[tokio::test]
    async fn test_bounds_not_available() {
        let ledger = ledger(Arc::new(MemoryChangeLog::new()));
        let err = ledger.max_position("testdb").await.unwrap_err();
        assert!(matches!(err, CdcError::NotAvailable(_)));

        let err = ledger.min_position("testdb", "dbo_orders").await.unwrap_err();
        assert!(matches!(err, CdcError::NotAvailable(_)));
    }

    #[tokio::test]
    async fn test_effective_start_clamps() {
        let log = Arc::new(MemoryChangeLog::new());
        log.create_change_table(entry("dbo_orders", 1001, 100, 0), &["id"]);
        log.truncate_before("testdb", "dbo_orders", lsn(120));
        let ledger = ledger(log);
        let mut table = ledger.discover_change_tables("testdb", None).await.unwrap()[0].clone();

        assert_eq!(ledger.effective_start(&table, &lsn(90)).await.unwrap(), lsn(100));
        assert_eq!(ledger.effective_start(&table, &lsn(150)).await.unwrap(), lsn(150));

        table.start_lsn = Lsn::NULL;
        assert_eq!(
            ledger.effective_start(&table, &Lsn::NULL).await.unwrap(),
            lsn(120)
        );
    }

    #[tokio::test]
    async fn test_validate_log_position() {
        let log = Arc::new(MemoryChangeLog::new());
        let ledger = ledger(log.clone());
        let partition = SqlServerPartition::new("srv1", "testdb");
        let offset = SqlServerOffsetContext::new("srv1", "testdb");

        assert!(!ledger.validate_log_position(&partition, &offset).await.unwrap());

        log.create_change_table(entry("dbo_orders", 1001, 100, 0), &["id"]);
        assert!(ledger.validate_log_position(&partition, &offset).await.unwrap());

        offset.set_position(
            crate::sqlserver::lsn::TxLogPosition::new(lsn(150), lsn(1)),
            2,
            1,
        );
        assert!(ledger.validate_log_position(&partition, &offset).await.unwrap());

        offset.set_position(
            crate::sqlserver::lsn::TxLogPosition::new(lsn(50), lsn(1)),
            2,
            1,
        );
        assert!(!ledger.validate_log_position(&partition, &offset).await.unwrap());
    }
}
