//! Change log access boundary
//!
//! [`ChangeLog`] is the set of raw queries the ledger and the reader issue
//! against a CDC-enabled database. Each method maps to one catalog or
//! function call; ordering, tie-breaking and availability rules live in
//! [`PositionLedger`](super::PositionLedger) and
//! [`ChangeStreamReader`](super::ChangeStreamReader).

use super::change_table::{CapturedColumn, ChangeRow, ChangeTable, ChangeTableEntry};
use super::lsn::Lsn;
use super::query::ChangesQuery;
use crate::common::{DataCollectionSchema, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Finite, ordered, single-pass sequence of change rows.
pub type ChangeRowStream = BoxStream<'static, Result<ChangeRow>>;

/// Raw change log queries for one server.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// `sys.fn_cdc_get_max_lsn()`
    async fn max_lsn(&self, database: &str) -> Result<Lsn>;

    /// `sys.fn_cdc_get_min_lsn(capture_instance)`
    async fn min_lsn(&self, database: &str, capture_instance: &str) -> Result<Lsn>;

    /// `sys.fn_cdc_increment_lsn(lsn)`
    async fn increment_lsn(&self, database: &str, lsn: &Lsn) -> Result<Lsn>;

    /// Largest commit LSN of a real transaction in `cdc.lsn_time_mapping`.
    async fn max_transaction_lsn(&self, database: &str) -> Result<Lsn>;

    /// Largest of the first `n` transaction LSNs.
    async fn nth_transaction_lsn_from_beginning(&self, database: &str, n: u32) -> Result<Lsn>;

    /// Largest of the first `n + 1` transaction LSNs at or after `last`.
    async fn nth_transaction_lsn_from_last(&self, database: &str, last: &Lsn, n: u32)
        -> Result<Lsn>;

    /// Smallest `start_lsn` over all change tables, NULL when there are none.
    async fn min_change_table_lsn(&self, database: &str) -> Result<Lsn>;

    /// All rows of `cdc.change_tables`.
    async fn change_table_entries(&self, database: &str) -> Result<Vec<ChangeTableEntry>>;

    /// All rows of `cdc.captured_columns`.
    async fn captured_columns(&self, database: &str) -> Result<Vec<CapturedColumn>>;

    /// Current structure of a change table's source table.
    async fn table_schema(&self, table: &ChangeTable) -> Result<DataCollectionSchema>;

    /// Whether the capture job can run.
    async fn is_agent_running(&self, database: &str) -> Result<bool>;

    /// Rows of one change table matching a bounded query, in query order.
    ///
    /// Fails with `ChangeTableGone` when the change table has been dropped.
    async fn fetch_changes(&self, table: &ChangeTable, query: &ChangesQuery)
        -> Result<ChangeRowStream>;
}
