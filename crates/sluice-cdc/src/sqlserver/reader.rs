//! Change stream reader
//!
//! Bounded, ordered range reads over one change table. A read resumes
//! strictly after the last processed change:
//!
//! ```text
//! (from, seq, op) < row <= to
//! ```
//!
//! Rows come back in `(position, sequence, operation)` order. Skipped
//! operations are removed by the query itself, so the dispatcher never sees
//! them.

use super::change_table::{ChangeTable, RowOperation};
use super::ledger::PositionLedger;
use super::log::ChangeRowStream;
use super::lsn::Lsn;
use super::query::{ChangesQuery, DataQueryMode};
use crate::common::{Operation, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, Instrument};

/// Reads ordered change rows through a [`PositionLedger`].
#[derive(Debug, Clone)]
pub struct ChangeStreamReader {
    ledger: Arc<PositionLedger>,
    mode: DataQueryMode,
    excluded: BTreeSet<i32>,
}

impl ChangeStreamReader {
    pub fn new(ledger: Arc<PositionLedger>, mode: DataQueryMode) -> Self {
        Self {
            ledger,
            mode,
            excluded: BTreeSet::new(),
        }
    }

    /// Leave out rows of these operations. Update removes both images.
    pub fn with_skipped_operations(mut self, skipped: &[Operation]) -> Self {
        self.excluded = RowOperation::excluded_ranks(skipped);
        self
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn mode(&self) -> DataQueryMode {
        self.mode
    }

    pub fn excluded_operations(&self) -> &BTreeSet<i32> {
        &self.excluded
    }

    /// Rows after `(from, from_seq, from_op)` up to and including `to`.
    ///
    /// The lower position is clamped to the table's effective start.
    /// `max_rows == 0` reads without a cap.
    pub async fn read(
        &self,
        table: &ChangeTable,
        from: &Lsn,
        from_seq: &Lsn,
        from_op: i32,
        to: &Lsn,
        max_rows: u32,
    ) -> Result<ChangeRowStream> {
        let span = tracing::debug_span!("read", table = %table.capture_instance);
        async {
            let start = self.ledger.effective_start(table, from).await?;
            let mut query = ChangesQuery::new(self.mode, start, *to)
                .with_max_rows(max_rows)
                .excluding(self.excluded.clone());
            if start == *from {
                query = query.after(*from_seq, from_op);
            }

            debug!(
                from = %start,
                seq = %query.from_seqval,
                op = query.from_operation,
                %to,
                max_rows,
                "Reading change table"
            );
            self.ledger.change_log().fetch_changes(table, &query).await
        }
        .instrument(span)
        .await
    }

    /// Rows in `(from, to]` from the start of the `from` position.
    pub async fn read_range(
        &self,
        table: &ChangeTable,
        from: &Lsn,
        to: &Lsn,
        max_rows: u32,
    ) -> Result<ChangeRowStream> {
        self.read(table, from, &Lsn::ZERO, 0, to, max_rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TableId;
    use crate::sqlserver::change_table::{ChangeRow, ChangeTableEntry};
    use crate::sqlserver::memory::MemoryChangeLog;
    use chrono::Utc;
    use futures::TryStreamExt;
    use serde_json::json;

    fn lsn(n: u32) -> Lsn {
        Lsn::from_parts(0, n, 0)
    }

    fn setup() -> (Arc<MemoryChangeLog>, ChangeStreamReader, ChangeTable) {
        let log = Arc::new(MemoryChangeLog::new());
        log.create_change_table(
            ChangeTableEntry {
                database: "testdb".into(),
                source_schema: "dbo".into(),
                source_table: "orders".into(),
                capture_instance: "dbo_orders".into(),
                object_id: 1001,
                source_object_id: 501,
                start_lsn: lsn(100),
                create_date: Utc::now(),
            },
            &["id", "name"],
        );
        let table = ChangeTable::new(
            TableId::new("testdb", "dbo", "orders"),
            "dbo_orders",
            1001,
            lsn(100),
            vec!["id".into(), "name".into()],
        );
        let ledger = Arc::new(PositionLedger::new(log.clone()));
        (log, ChangeStreamReader::new(ledger, DataQueryMode::Function), table)
    }

    fn insert(log: &MemoryChangeLog, pos: u32, seq: u32, op: RowOperation) {
        log.insert(
            "testdb",
            "dbo_orders",
            ChangeRow::new(lsn(pos), lsn(seq), op, vec![json!(pos), json!("x")]),
        );
    }

    #[tokio::test]
    async fn test_resumes_after_update_before_image() {
        let (log, reader, table) = setup();
        insert(&log, 150, 1, RowOperation::UpdateBefore);
        insert(&log, 150, 1, RowOperation::UpdateAfter);
        insert(&log, 160, 1, RowOperation::Insert);

        let rows: Vec<_> = reader
            .read(&table, &lsn(150), &lsn(1), 3, &lsn(200), 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.order_key()).collect();
        assert_eq!(keys, vec![(lsn(150), lsn(1), 4), (lsn(160), lsn(1), 2)]);
    }

    #[tokio::test]
    async fn test_skipped_updates_are_not_read() {
        let (log, reader, table) = setup();
        let reader = reader.with_skipped_operations(&[Operation::Update]);
        insert(&log, 150, 1, RowOperation::UpdateBefore);
        insert(&log, 150, 1, RowOperation::UpdateAfter);
        insert(&log, 150, 2, RowOperation::Delete);

        let rows: Vec<_> = reader
            .read_range(&table, &lsn(100), &lsn(200), 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_operation(), Some(RowOperation::Delete));
    }

    #[tokio::test]
    async fn test_clamped_start_ignores_resume_point() {
        let (log, reader, table) = setup();
        insert(&log, 101, 1, RowOperation::Insert);

        // a resume point before the table start reads from the table start
        let rows: Vec<_> = reader
            .read(&table, &lsn(50), &lsn(9), 4, &lsn(200), 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
